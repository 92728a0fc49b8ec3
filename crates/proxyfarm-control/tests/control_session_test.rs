//! Integration tests for controller/agent control sessions
//!
//! Both runtimes run over in-memory duplex streams: handshake, re-sync on
//! activation, stale session handling, and agent-side buffering.

use async_trait::async_trait;
use proxyfarm_control::{
    AgentConfig, AgentRuntime, AgentSpec, ControlChannel, ControlError, ControlSession,
    Controller, ControllerConfig, DriverError, KnownAgent, MockUplinkDriver, SessionConfig,
    SessionError, SessionOutput, StaticDesiredState, UplinkDriver, UplinkSpec,
};
use proxyfarm_crypto::{HandshakeError, SharedSecret};
use proxyfarm_proto::{
    AgentStatus, Command, ControlMessage, Envelope, Event, LogPayload, Operation, SystemHealth,
    Uplink,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

const AGENT_ID: &str = "worker_1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Mock driver that counts commands per (operation, uplink)
struct CountingDriver {
    inner: MockUplinkDriver,
    seen: Mutex<HashMap<(Operation, String), usize>>,
}

impl CountingDriver {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MockUplinkDriver::new(),
            seen: Mutex::new(HashMap::new()),
        })
    }

    fn count(&self, operation: Operation, uplink_id: &str) -> usize {
        *self
            .seen
            .lock()
            .unwrap()
            .get(&(operation, uplink_id.to_string()))
            .unwrap_or(&0)
    }
}

#[async_trait]
impl UplinkDriver for CountingDriver {
    async fn uplinks(&self) -> Vec<Uplink> {
        self.inner.uplinks().await
    }

    async fn health(&self) -> SystemHealth {
        self.inner.health().await
    }

    async fn execute(&self, command: &Command) -> Result<(), DriverError> {
        *self
            .seen
            .lock()
            .unwrap()
            .entry((command.operation, command.target_uplink_id.clone()))
            .or_insert(0) += 1;
        self.inner.execute(command).await
    }
}

fn known(shared_key: &str) -> KnownAgent {
    KnownAgent {
        agent_id: AGENT_ID.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        shared_key: shared_key.to_string(),
    }
}

fn uplink(id: &str, active: bool) -> UplinkSpec {
    UplinkSpec {
        id: id.to_string(),
        entry_port: None,
        target_host: None,
        target_port: None,
        active,
        parameters: None,
    }
}

fn controller(shared_key: &str) -> Arc<Controller> {
    let state = StaticDesiredState::new(vec![AgentSpec {
        agent: known(shared_key),
        uplinks: vec![uplink("mock_modem_1", true), uplink("mock_modem_2", false)],
    }]);
    let config = ControllerConfig {
        handshake_timeout: Duration::from_secs(2),
        ..ControllerConfig::default()
    };
    Controller::new(config, Arc::new(state))
}

fn agent(shared_key: &str, driver: Arc<CountingDriver>) -> Arc<AgentRuntime> {
    let mut config = AgentConfig::new(AGENT_ID, shared_key);
    config.handshake_timeout = Duration::from_secs(2);
    Arc::new(AgentRuntime::new(config, driver))
}

/// Connect `agent` to `controller` over a fresh duplex pair
fn connect(
    controller: &Arc<Controller>,
    agent: &Arc<AgentRuntime>,
    shared_key: &str,
) -> (
    tokio::task::JoinHandle<Result<(), ControlError>>,
    tokio::task::JoinHandle<Result<(), ControlError>>,
) {
    let (agent_io, controller_io) = tokio::io::duplex(64 * 1024);

    let controller = Arc::clone(controller);
    let agent_def = known(shared_key);
    let controller_task =
        tokio::spawn(async move { controller.serve_connection(&agent_def, controller_io).await });

    let agent = Arc::clone(agent);
    let agent_task = tokio::spawn(async move { agent.handle_connection(agent_io).await });

    (controller_task, agent_task)
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let result = timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "Timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_register_and_resync() {
    init_tracing();

    let controller = controller("k");
    let driver = CountingDriver::new();
    let agent = agent("k", Arc::clone(&driver));
    let mut states = controller.subscribe_state();

    let (_controller_task, _agent_task) = connect(&controller, &agent, "k");

    // REGISTER carries the mock uplinks
    let change = timeout(Duration::from_secs(5), async {
        loop {
            let change = states.recv().await.unwrap();
            if !change.uplinks.is_empty() {
                return change;
            }
        }
    })
    .await
    .expect("No REGISTER state change");
    assert_eq!(change.agent_id, AGENT_ID);
    assert_eq!(change.status, AgentStatus::Online);
    assert_eq!(change.uplinks.len(), 2);

    wait_for("START of active uplink", || {
        driver.count(Operation::Start, "mock_modem_1") == 1
    })
    .await;
    assert_eq!(driver.count(Operation::Start, "mock_modem_2"), 0);

    let state = controller.agent(AGENT_ID).unwrap();
    assert_eq!(state.status, AgentStatus::Online);
    assert!(state.snapshot.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_resync_once_per_activation() {
    init_tracing();

    let controller = controller("k");
    let driver = CountingDriver::new();
    let agent = agent("k", Arc::clone(&driver));

    for activation in 1..=3 {
        let (controller_task, agent_task) = connect(&controller, &agent, "k");
        wait_for("session active", || controller.is_connected(AGENT_ID)).await;
        wait_for("re-sync START", || {
            driver.count(Operation::Start, "mock_modem_1") == activation
        })
        .await;

        assert!(controller.disconnect(AGENT_ID));
        timeout(Duration::from_secs(5), controller_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(5), agent_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.count(Operation::Start, "mock_modem_1"), 3);
    assert_eq!(
        controller.agent(AGENT_ID).unwrap().status,
        AgentStatus::Offline
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wrong_secret_rejected_by_agent() {
    init_tracing();

    let controller = controller("wrong");
    let driver = CountingDriver::new();
    let agent = agent("k", Arc::clone(&driver));
    let mut states = controller.subscribe_state();

    let (controller_task, agent_task) = connect(&controller, &agent, "wrong");

    let agent_result = timeout(Duration::from_secs(5), agent_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        agent_result,
        Err(ControlError::Session(SessionError::Handshake(
            HandshakeError::MacMismatch
        )))
    ));

    let controller_result = timeout(Duration::from_secs(5), controller_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        controller_result,
        Err(ControlError::HandshakeRejected)
    ));
    assert!(!controller.is_connected(AGENT_ID));
    assert_eq!(driver.count(Operation::Start, "mock_modem_1"), 0);
    assert!(!agent.link().is_active());

    // Never shown online, not even briefly
    while let Ok(change) = states.try_recv() {
        assert_ne!(change.status, AgentStatus::Online, "{:?}", change);
    }
    assert_ne!(
        controller.agent(AGENT_ID).map(|state| state.status),
        Some(AgentStatus::Online)
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_pending_until_agent_confirms() {
    init_tracing();

    let controller = controller("k");
    let mut states = controller.subscribe_state();
    let (agent_io, controller_io) = tokio::io::duplex(64 * 1024);

    let server = Arc::clone(&controller);
    let controller_task =
        tokio::spawn(async move { server.serve_connection(&known("k"), controller_io).await });

    let mut channel = ControlChannel::new(agent_io);
    let mut session = ControlSession::agent(AGENT_ID, SharedSecret::new("k"), SessionConfig::default());
    channel.handshake(&mut session).await.unwrap();

    // ACK exchanged, but the agent has not spoken under the new key yet
    let early = timeout(Duration::from_millis(200), channel.recv()).await;
    assert!(early.is_err(), "controller sent before confirmation");
    assert!(!controller.is_connected(AGENT_ID));
    assert!(states.try_recv().is_err());

    let hello = Event::Log(LogPayload {
        level: "INFO".to_string(),
        msg: "up".to_string(),
        timestamp: None,
    });
    channel.send(session.seal(&hello).unwrap()).await.unwrap();
    wait_for("session confirmed", || controller.is_connected(AGENT_ID)).await;
    assert_eq!(
        states.recv().await.unwrap().status,
        AgentStatus::Online
    );

    // Re-sync follows confirmation
    let msg = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(matches!(
        session.handle(msg).unwrap(),
        SessionOutput::Event(Event::Command(cmd)) if cmd.operation == Operation::Start
    ));

    drop(channel);
    timeout(Duration::from_secs(5), controller_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_agent_after_ack_times_out() {
    init_tracing();

    let state = StaticDesiredState::new(Vec::new());
    let config = ControllerConfig {
        handshake_timeout: Duration::from_millis(200),
        ..ControllerConfig::default()
    };
    let controller = Controller::new(config, Arc::new(state));
    let (agent_io, controller_io) = tokio::io::duplex(64 * 1024);

    let server = Arc::clone(&controller);
    let controller_task =
        tokio::spawn(async move { server.serve_connection(&known("k"), controller_io).await });

    let mut channel = ControlChannel::new(agent_io);
    let mut session = ControlSession::agent(AGENT_ID, SharedSecret::new("k"), SessionConfig::default());
    channel.handshake(&mut session).await.unwrap();

    let result = timeout(Duration::from_secs(5), controller_task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ControlError::HandshakeTimeout)));
    assert!(!controller.is_connected(AGENT_ID));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commands_reach_driver() {
    init_tracing();

    let controller = controller("k");
    let driver = CountingDriver::new();
    let agent = agent("k", Arc::clone(&driver));

    assert!(matches!(
        controller.send_command(AGENT_ID, Command::new(Operation::Reboot, "mock_modem_2")),
        Err(ControlError::NotConnected(_))
    ));

    let (_controller_task, _agent_task) = connect(&controller, &agent, "k");
    wait_for("session active", || controller.is_connected(AGENT_ID)).await;

    controller
        .send_command(AGENT_ID, Command::new(Operation::Reboot, "mock_modem_2"))
        .unwrap();
    wait_for("REBOOT executed", || {
        driver.count(Operation::Reboot, "mock_modem_2") == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stale_session_teardown_ignored() {
    init_tracing();

    let controller = controller("k");
    let driver = CountingDriver::new();
    let agent = agent("k", Arc::clone(&driver));

    let (first_controller, first_agent) = connect(&controller, &agent, "k");
    wait_for("first session", || controller.is_connected(AGENT_ID)).await;
    let first_session = controller.agent(AGENT_ID).unwrap().session_id;

    let (_second_controller, _second_agent) = connect(&controller, &agent, "k");
    wait_for("second session", || {
        let current = controller.agent(AGENT_ID).unwrap().session_id;
        current.is_some() && current != first_session
    })
    .await;

    // Both ends of the superseded session wind down on their own
    timeout(Duration::from_secs(5), first_controller)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    timeout(Duration::from_secs(5), first_agent)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    // ...without taking the agent offline
    assert!(controller.is_connected(AGENT_ID));
    assert_eq!(
        controller.agent(AGENT_ID).unwrap().status,
        AgentStatus::Online
    );

    controller
        .send_command(AGENT_ID, Command::new(Operation::Stop, "mock_modem_1"))
        .unwrap();
    wait_for("STOP via new session", || {
        driver.count(Operation::Stop, "mock_modem_1") == 1
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_envelope_before_handshake_is_dropped() {
    init_tracing();

    let controller = controller("k");
    let (agent_io, controller_io) = tokio::io::duplex(64 * 1024);

    let server = Arc::clone(&controller);
    let controller_task =
        tokio::spawn(async move { server.serve_connection(&known("k"), controller_io).await });

    // Speak the protocol by hand, starting with a premature envelope
    let mut channel = ControlChannel::new(agent_io);
    channel
        .send(ControlMessage::Encrypted(Envelope {
            iv: "AAAAAAAAAAAAAAAA".to_string(),
            ciphertext: "AAAA".to_string(),
            tag: "AAAAAAAAAAAAAAAAAAAAAA==".to_string(),
        }))
        .await
        .unwrap();

    let mut session = ControlSession::agent(AGENT_ID, SharedSecret::new("k"), SessionConfig::default());
    channel.handshake(&mut session).await.unwrap();
    let hello = Event::Log(LogPayload {
        level: "INFO".to_string(),
        msg: "hello".to_string(),
        timestamp: None,
    });
    channel.send(session.seal(&hello).unwrap()).await.unwrap();
    wait_for("session active", || controller.is_connected(AGENT_ID)).await;

    // Re-sync START for the active uplink arrives first
    let msg = timeout(Duration::from_secs(5), channel.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match session.handle(msg).unwrap() {
        SessionOutput::Event(Event::Command(cmd)) => {
            assert_eq!(cmd.operation, Operation::Start);
            assert_eq!(cmd.target_uplink_id, "mock_modem_1");
        }
        other => panic!("Expected START, got {:?}", other),
    }

    drop(channel);
    timeout(Duration::from_secs(5), controller_task)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_outbox_flushed_before_register() {
    init_tracing();

    let driver = CountingDriver::new();
    let agent = agent("k", driver);
    let link = agent.link();

    let log = |msg: &str| {
        Event::Log(LogPayload {
            level: "INFO".to_string(),
            msg: msg.to_string(),
            timestamp: None,
        })
    };
    link.send(log("buffered 1"));
    link.send(log("buffered 2"));
    assert_eq!(link.outbox_len(), 2);

    let (agent_io, controller_io) = tokio::io::duplex(64 * 1024);
    let runtime = Arc::clone(&agent);
    let _agent_task = tokio::spawn(async move { runtime.handle_connection(agent_io).await });

    let mut channel = ControlChannel::new(controller_io);
    let mut session =
        ControlSession::controller(AGENT_ID, SharedSecret::new("k"), SessionConfig::default());
    channel.handshake(&mut session).await.unwrap();

    let mut events = Vec::new();
    while events.len() < 3 {
        let msg = timeout(Duration::from_secs(5), channel.recv())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let SessionOutput::Event(event) = session.handle(msg).unwrap() {
            events.push(event);
        }
    }

    assert_eq!(events[0], log("buffered 1"));
    assert_eq!(events[1], log("buffered 2"));
    assert!(matches!(&events[2], Event::Register(snapshot) if snapshot.id == AGENT_ID));
    assert_eq!(link.outbox_len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_logs_reach_controller() {
    init_tracing();

    let controller = controller("k");
    let driver = CountingDriver::new();
    let agent = agent("k", driver);
    let mut logs = controller.subscribe_logs();

    let (_controller_task, _agent_task) = connect(&controller, &agent, "k");
    wait_for("session active", || controller.is_connected(AGENT_ID)).await;

    agent.link().send(Event::Log(LogPayload {
        level: "WARN".to_string(),
        msg: "signal low on wwan1".to_string(),
        timestamp: Some(1_700_000_000_000),
    }));

    let entry = timeout(Duration::from_secs(5), logs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.agent_id, AGENT_ID);
    assert_eq!(entry.level, "WARN");
    assert_eq!(entry.msg, "signal low on wwan1");
    assert_eq!(entry.timestamp.timestamp_millis(), 1_700_000_000_000);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_timeout() {
    init_tracing();

    let state = StaticDesiredState::new(Vec::new());
    let config = ControllerConfig {
        handshake_timeout: Duration::from_millis(100),
        ..ControllerConfig::default()
    };
    let controller = Controller::new(config, Arc::new(state));

    // Peer that never speaks
    let (_silent, controller_io) = tokio::io::duplex(1024);
    let result = controller.serve_connection(&known("k"), controller_io).await;
    assert!(matches!(result, Err(ControlError::HandshakeTimeout)));
    assert!(!controller.is_connected(AGENT_ID));
}
