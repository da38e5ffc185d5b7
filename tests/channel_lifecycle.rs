use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::Level;

use livechannel::channel::channel::Channel;
use livechannel::channel::channel_config::ChannelConfig;
use livechannel::channel::channel_events::ChannelEvent;
use livechannel::channel::channel_state::{ChannelState, ChannelStatus, Closure};
use livechannel::endpoint::EndpointDescriptor;
use livechannel::error::{ChannelError, CloseCause, UsageError};
use livechannel::test_util::transport::{OpenBehavior, ScriptedTransport};
use livechannel::transport::TransportError;

#[ctor::ctor]
fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(Level::DEBUG)
        .try_init()
        .ok();
}

fn endpoint() -> EndpointDescriptor {
    EndpointDescriptor::new("ws", "localhost", "/streams/a/channel")
}

fn other_endpoint() -> EndpointDescriptor {
    EndpointDescriptor::new("ws", "localhost", "/streams/b/channel")
        .with_query("includeInitialValues", true)
}

fn reset() -> TransportError {
    TransportError::ConnectionLost("connection reset by peer".to_string())
}

fn refused() -> TransportError {
    TransportError::Connect("connection refused".to_string())
}

async fn open(config: ChannelConfig) -> (Arc<ScriptedTransport>, Channel) {
    let transport = ScriptedTransport::new();
    let channel = Channel::open(endpoint(), transport.clone(), config).await.unwrap();
    (transport, channel)
}

async fn wait_for(channel: &Channel, predicate: impl Fn(&ChannelStatus) -> bool) -> ChannelStatus {
    let mut status = channel.watch_status();
    loop {
        {
            let current = status.borrow_and_update();
            if predicate(&*current) {
                return current.clone();
            }
        }
        status.changed().await.expect("channel driver terminated");
    }
}

async fn recv_text(channel: &Channel) -> String {
    channel.recv().await.unwrap()
        .as_text().unwrap()
        .to_string()
}

#[tokio::test(start_paused = true)]
async fn test_ordered_delivery_across_reconnect() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;

    let first = transport.connection(0);
    first.send_text("a");
    first.send_text("b");
    first.fail(reset());

    let second = transport.wait_for_connection(1).await;
    assert_eq!(second.endpoint(), &endpoint());
    second.send_text("c");
    second.send_text("d");

    for expected in ["a", "b", "c", "d"] {
        assert_eq!(recv_text(&channel).await, expected);
    }
    wait_for(&channel, |s| s.state.is_open()).await;
    assert_eq!(channel.buffered(), 0);
    assert_eq!(transport.open_attempts().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_recv_loses_nothing() {
    let (transport, channel) = open(ChannelConfig::new()).await;

    for _ in 0..3 {
        assert!(time::timeout(Duration::from_millis(100), channel.recv()).await.is_err());
    }

    transport.connection(0).send_text("x");
    assert_eq!(recv_text(&channel).await, "x");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_without_reconnect_closes_with_cause() {
    let (transport, channel) = open(ChannelConfig::new()).await;

    let connection = transport.connection(0);
    connection.send_text("a");
    connection.fail(reset());

    let status = wait_for(&channel, |s| s.state.is_closed()).await;
    assert_eq!(status.state, ChannelState::Closed(Closure::Error(CloseCause::Transport(reset()))));
    assert_eq!(channel.close_cause(), Some(CloseCause::Transport(reset())));

    // buffered messages are still delivered, then the cause is reported
    assert_eq!(recv_text(&channel).await, "a");
    assert_eq!(channel.recv().await.err(), Some(ChannelError::Closed { cause: CloseCause::Transport(reset()) }));
    assert_eq!(channel.recv().await.err(), Some(ChannelError::Closed { cause: CloseCause::Transport(reset()) }));
    assert_eq!(transport.open_attempts().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remote_close_is_a_disconnect() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;

    transport.connection(0).close_remote();
    transport.wait_for_connection(1).await;

    wait_for(&channel, |s| s.state.is_open()).await;
    assert!(!transport.connection(0).is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_watchdog_fires_at_deadline_not_before() {
    let dead_channel_timeout = Duration::from_secs(10);
    let (transport, channel) = open(ChannelConfig::reconnecting(Some(dead_channel_timeout))).await;
    transport.script((0..100).map(|_| OpenBehavior::Fail(refused())));

    let start = Instant::now();
    transport.connection(0).fail(reset());

    let status = wait_for(&channel, |s| s.state.is_reconnecting()).await;
    let deadline = status.watchdog_deadline.expect("watchdog deadline");
    assert!(deadline >= start + dead_channel_timeout);

    time::sleep_until(deadline - Duration::from_millis(1)).await;
    let status = channel.status();
    assert!(status.state.is_reconnecting());
    assert!(status.reconnect_attempts > 0);

    let status = wait_for(&channel, |s| s.state.is_closed()).await;
    assert!(Instant::now() >= deadline);
    assert_eq!(status.watchdog_deadline, None);
    assert_eq!(channel.close_cause(), Some(CloseCause::WatchdogTimeout { after: dead_channel_timeout }));
    assert!(channel.close_cause().unwrap().is_watchdog_timeout());
    assert_eq!(channel.recv().await.err(), Some(ChannelError::Closed { cause: CloseCause::WatchdogTimeout { after: dead_channel_timeout } }));

    // no more reconnect attempts after the watchdog fired
    let attempts = transport.open_attempts().len();
    time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.open_attempts().len(), attempts);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_are_published() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;
    let mut events = channel.subscribe();
    transport.script([OpenBehavior::Fail(refused()), OpenBehavior::Hang]);

    transport.connection(0).fail(reset());
    transport.wait_for_connection(1).await;
    let status = wait_for(&channel, |s| s.state.is_open()).await;
    assert_eq!(status.reconnect_attempts, 0);

    let mut failed_attempts = Vec::new();
    let mut states = Vec::new();
    while let Ok(evt) = events.try_recv() {
        match evt {
            ChannelEvent::ReconnectAttemptFailed(data) => failed_attempts.push((data.attempt, data.error)),
            ChannelEvent::StateChanged(data) => states.push(data.new_state),
            _ => {}
        }
    }
    assert_eq!(failed_attempts, vec![
        (1, refused()),
        (2, TransportError::Timeout(ChannelConfig::new().open_timeout)),
    ]);
    assert_eq!(states, vec![ChannelState::Reconnecting, ChannelState::Open]);
}

#[tokio::test(start_paused = true)]
async fn test_update_switches_endpoint_and_keeps_buffer() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    let mut events = channel.subscribe();

    transport.connection(0).send_text("old");
    while channel.buffered() == 0 {
        tokio::task::yield_now().await;
    }

    channel.update(other_endpoint(), false).await.unwrap();

    assert!(channel.is_open());
    assert_eq!(channel.endpoint(), other_endpoint());
    assert!(transport.connection(0).is_closed());

    let connection = transport.connection(1);
    assert_eq!(connection.endpoint(), &other_endpoint());
    connection.send_text("new");

    let old = channel.recv().await.unwrap();
    assert_eq!(old.as_text(), Some("old"));
    assert_eq!(old.endpoint(), &endpoint());
    let new = channel.recv().await.unwrap();
    assert_eq!(new.as_text(), Some("new"));
    assert_eq!(new.endpoint(), &other_endpoint());

    let mut endpoint_changes = Vec::new();
    while let Ok(evt) = events.try_recv() {
        if let ChannelEvent::EndpointChanged(data) = evt {
            endpoint_changes.push((data.old_endpoint, data.new_endpoint));
        }
    }
    assert_eq!(endpoint_changes, vec![(endpoint(), other_endpoint())]);
}

#[tokio::test(start_paused = true)]
async fn test_update_failure_with_rollback_keeps_original_endpoint() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    transport.script([OpenBehavior::Fail(refused())]);

    let result = channel.update(other_endpoint(), true).await;

    assert_eq!(result, Err(ChannelError::RolledBack { endpoint: endpoint(), cause: refused() }));
    assert!(channel.is_open());
    assert_eq!(channel.endpoint(), endpoint());
    assert_eq!(transport.open_attempts(), vec![endpoint(), other_endpoint(), endpoint()]);

    transport.connection(1).send_text("still here");
    assert_eq!(recv_text(&channel).await, "still here");
}

#[tokio::test(start_paused = true)]
async fn test_update_failure_with_failed_rollback_closes() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    transport.script([OpenBehavior::Fail(refused()), OpenBehavior::Fail(reset())]);

    let result = channel.update(other_endpoint(), true).await;

    assert_eq!(result, Err(ChannelError::UpdateFailed { endpoint: other_endpoint(), cause: refused() }));
    assert_eq!(channel.state(), ChannelState::Closed(Closure::Error(CloseCause::Transport(reset()))));
}

#[tokio::test(start_paused = true)]
async fn test_update_failure_without_rollback_closes() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    transport.connection(0).send_text("before");
    while channel.buffered() == 0 {
        tokio::task::yield_now().await;
    }
    transport.script([OpenBehavior::Hang]);

    let result = channel.update(other_endpoint(), false).await;

    let timeout = TransportError::Timeout(ChannelConfig::new().open_timeout);
    assert_eq!(result, Err(ChannelError::UpdateFailed { endpoint: other_endpoint(), cause: timeout.clone() }));
    assert!(channel.is_closed());
    assert_eq!(channel.close_cause(), Some(CloseCause::Transport(timeout.clone())));
    assert_eq!(channel.endpoint(), endpoint());
    assert_eq!(transport.open_attempts(), vec![endpoint(), other_endpoint()]);

    assert_eq!(recv_text(&channel).await, "before");
    assert_eq!(channel.recv().await.err(), Some(ChannelError::Closed { cause: CloseCause::Transport(timeout) }));

    assert_eq!(channel.update(endpoint(), true).await, Err(ChannelError::Usage(UsageError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_update_while_reconnecting_starts_fresh() {
    let (transport, channel) = open(ChannelConfig::reconnecting(Some(Duration::from_secs(30)))).await;
    transport.script([OpenBehavior::Hang]);

    transport.connection(0).fail(reset());
    let status = wait_for(&channel, |s| s.state.is_reconnecting()).await;
    assert!(status.watchdog_deadline.is_some());

    // wait for the reconnect loop to be stuck in its first attempt
    while transport.open_attempts().len() < 2 {
        time::sleep(Duration::from_millis(10)).await;
    }

    channel.update(other_endpoint(), false).await.unwrap();

    let status = channel.status();
    assert_eq!(status.state, ChannelState::Open);
    assert_eq!(status.watchdog_deadline, None);
    assert_eq!(status.endpoint, other_endpoint());

    // the superseded watchdog does not fire
    time::sleep(Duration::from_secs(60)).await;
    assert!(channel.is_open());
}

#[tokio::test]
async fn test_update_usage_errors() {
    let (_transport, channel) = open(ChannelConfig::new()).await;

    assert!(matches!(
        channel.update(EndpointDescriptor::new("https", "localhost", "/"), true).await,
        Err(ChannelError::Usage(UsageError::InvalidEndpoint(_)))
    ));
    assert!(channel.is_open());

    channel.close().await.unwrap();
    assert_eq!(channel.update(other_endpoint(), true).await, Err(ChannelError::Usage(UsageError::Closed)));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_update_is_usage_error() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    transport.script([OpenBehavior::Hang]);

    let first = channel.update(other_endpoint(), false);
    tokio::pin!(first);
    assert!(time::timeout(Duration::from_millis(10), &mut first).await.is_err());

    assert_eq!(channel.update(other_endpoint(), false).await, Err(ChannelError::Usage(UsageError::ConcurrentUpdate)));
    assert!(matches!(first.await, Err(ChannelError::UpdateFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_recv_is_usage_error_in_any_state() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;
    transport.script([OpenBehavior::Hang]);
    transport.connection(0).fail(reset());
    wait_for(&channel, |s| s.state.is_reconnecting()).await;

    let first = channel.recv();
    tokio::pin!(first);
    assert!(time::timeout(Duration::from_millis(10), &mut first).await.is_err());

    assert_eq!(channel.recv().await.err(), Some(ChannelError::Usage(UsageError::ConcurrentReceive)));

    channel.close().await.unwrap();
    assert_eq!(first.await.err(), Some(ChannelError::ClosedOk));
}

#[tokio::test(start_paused = true)]
async fn test_close_while_reconnecting() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;
    transport.script((0..100).map(|_| OpenBehavior::Fail(refused())));
    transport.connection(0).fail(reset());
    wait_for(&channel, |s| s.state.is_reconnecting()).await;

    channel.close().await.unwrap();

    assert_eq!(channel.state(), ChannelState::Closed(Closure::Ok));
    let attempts = transport.open_attempts().len();
    time::sleep(Duration::from_secs(600)).await;
    assert_eq!(transport.open_attempts().len(), attempts);
}

#[tokio::test]
async fn test_double_close_is_noop() {
    let (transport, channel) = open(ChannelConfig::new()).await;

    channel.close().await.unwrap();
    assert!(transport.connection(0).is_closed());
    assert_eq!(channel.state(), ChannelState::Closed(Closure::Ok));

    channel.close().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Closed(Closure::Ok));
    assert_eq!(channel.recv().await.err(), Some(ChannelError::ClosedOk));
}

#[tokio::test]
async fn test_close_after_failure_keeps_cause() {
    let (transport, channel) = open(ChannelConfig::new()).await;
    transport.connection(0).fail(reset());
    wait_for(&channel, |s| s.state.is_closed()).await;

    channel.close().await.unwrap();
    assert_eq!(channel.close_cause(), Some(CloseCause::Transport(reset())));
}

#[tokio::test(start_paused = true)]
async fn test_oversized_message_is_protocol_failure() {
    let config = ChannelConfig {
        max_message_size: Some(8),
        ..ChannelConfig::new()
    };
    let (transport, channel) = open(config).await;

    transport.connection(0).send_text("0123456789");

    wait_for(&channel, |s| s.state.is_closed()).await;
    let cause = channel.close_cause().unwrap();
    assert_eq!(cause, CloseCause::Transport(TransportError::MessageTooLarge { size: 10, limit: 8 }));
}

#[tokio::test(start_paused = true)]
async fn test_full_buffer_applies_back_pressure() {
    let config = ChannelConfig {
        max_queue: Some(2),
        ..ChannelConfig::new()
    };
    let (transport, channel) = open(config).await;

    let connection = transport.connection(0);
    for i in 0..5 {
        connection.send_text(&i.to_string());
    }
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.buffered(), 2);

    for i in 0..5 {
        assert_eq!(recv_text(&channel).await, i.to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn test_update_with_full_buffer_loses_nothing() {
    let config = ChannelConfig {
        max_queue: Some(1),
        ..ChannelConfig::new()
    };
    let (transport, channel) = open(config).await;

    let first = transport.connection(0);
    first.send_text("a");
    first.send_text("b");
    // "a" fills the buffer, "b" is taken from the connection and waits for room
    time::sleep(Duration::from_millis(100)).await;
    assert_eq!(channel.buffered(), 1);

    channel.update(other_endpoint(), false).await.unwrap();
    assert!(first.is_closed());
    transport.connection(1).send_text("c");

    for expected in ["a", "b", "c"] {
        assert_eq!(recv_text(&channel).await, expected);
    }
}

#[tokio::test(start_paused = true)]
async fn test_close_with_full_buffer_loses_nothing() {
    let config = ChannelConfig {
        max_queue: Some(1),
        ..ChannelConfig::new()
    };
    let (transport, channel) = open(config).await;

    let connection = transport.connection(0);
    connection.send_text("a");
    connection.send_text("b");
    time::sleep(Duration::from_millis(100)).await;

    channel.close().await.unwrap();

    assert_eq!(recv_text(&channel).await, "a");
    assert_eq!(recv_text(&channel).await, "b");
    assert_eq!(channel.recv().await.err(), Some(ChannelError::ClosedOk));
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_failed_attempt_loses_nothing() {
    let (transport, channel) = open(ChannelConfig::reconnecting(None)).await;
    transport.script([OpenBehavior::Fail(refused())]);
    let mut events = channel.subscribe();

    let first = transport.connection(0);
    first.send_text("a");
    first.send_text("b");
    first.fail(reset());

    let second = transport.wait_for_connection(1).await;
    second.send_text("c");

    for expected in ["a", "b", "c"] {
        assert_eq!(recv_text(&channel).await, expected);
    }
    wait_for(&channel, |s| s.state.is_open()).await;
    assert_eq!(transport.open_attempts(), vec![endpoint(), endpoint(), endpoint()]);

    let mut failed_attempts = Vec::new();
    while let Ok(evt) = events.try_recv() {
        if let ChannelEvent::ReconnectAttemptFailed(data) = evt {
            failed_attempts.push((data.attempt, data.error));
        }
    }
    assert_eq!(failed_attempts, vec![(1, refused())]);
}
