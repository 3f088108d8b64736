//! End-to-end conversation flows over the simulated robot.

mod common;

use std::sync::Arc;
use std::time::Duration;

use clawbody_middleware::{PlatformCall, Topic, TopicReceiver};
use clawbody_runtime::{AgentReply, BridgeConfig, EngineState, Session};
use clawbody_types::{ActionTarget, AgentDirective, BodyError, EventPayload, Role, Subsystem};
use common::{
    AUDIO_CHUNKS_PER_REPLY, MockGateway, behaviors, scripted_transport, sim_session, speech_chunks,
};

const WAIT: Duration = Duration::from_secs(5);

async fn agent_turn_ended(rx: &mut TopicReceiver) -> bool {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.next_event().await {
            if let EventPayload::TurnEnded {
                role: Role::Agent,
                aborted,
                ..
            } = event.payload
            {
                return aborted;
            }
        }
        panic!("conversation topic closed");
    })
    .await
    .expect("agent turn should end")
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let reached = tokio::time::timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

fn position(calls: &[PlatformCall], wanted: impl Fn(&PlatformCall) -> bool) -> Option<usize> {
    calls.iter().position(wanted)
}

fn reply(text: &str) -> AgentReply {
    AgentReply {
        text: text.to_string(),
        directives: Vec::new(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_is_answered_without_gesture() {
    let gateway = Arc::new(MockGateway::default().reply("hello", reply("hi there")));
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(Arc::clone(&gateway), transport);
    let session = Session::start(config, deps).await.unwrap();
    let mut conversation = session.bus().subscribe_to(Topic::Conversation);

    script.user_says("hello");
    assert!(!agent_turn_ended(&mut conversation).await, "turn closes normally");

    assert!(
        platform
            .wait_for(WAIT, |calls| speech_chunks(calls) == AUDIO_CHUNKS_PER_REPLY)
            .await
    );
    assert!(
        behaviors(&platform.calls()).iter().all(|b| b == "thinking"),
        "only the thinking emotion may play"
    );
    assert!(!matches!(session.gesture_state(), EngineState::Cooldown { .. }));
    assert_eq!(*gateway.submitted.lock().unwrap(), vec!["hello".to_string()]);
    assert_eq!(script.spoken(), vec!["hi there".to_string()]);

    let synced = tokio::time::timeout(WAIT, async {
        loop {
            if !gateway.synced.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(synced.is_ok());
    assert_eq!(
        gateway.synced.lock().unwrap()[0],
        ("hello".to_string(), "hi there".to_string())
    );

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dance_cue_plays_exactly_one_dance() {
    let gateway = Arc::new(MockGateway::default());
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(gateway, transport);
    let session = Session::start(config, deps).await.unwrap();

    script.user_says("let's dance");
    assert!(
        platform
            .wait_for(WAIT, |calls| !behaviors(calls).is_empty())
            .await
    );
    assert!(matches!(
        session.gesture_state(),
        EngineState::Cooldown { .. }
    ));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(behaviors(&platform.calls()), vec!["chicken_peck".to_string()]);

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gateway_outage_falls_back_and_alerts() {
    let gateway = Arc::new(MockGateway::unreachable());
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(gateway, transport);
    let session = Session::start(config, deps).await.unwrap();
    let mut conversation = session.bus().subscribe_to(Topic::Conversation);
    let mut alerts = session.bus().subscribe_to(Topic::SystemAlerts);

    script.user_says("are you there");
    assert!(!agent_turn_ended(&mut conversation).await);
    assert_eq!(script.spoken(), vec![BridgeConfig::default().fallback_reply]);
    assert!(
        platform
            .wait_for(WAIT, |calls| speech_chunks(calls) == AUDIO_CHUNKS_PER_REPLY)
            .await
    );

    let degraded = tokio::time::timeout(WAIT, async {
        while let Some(event) = alerts.next_event().await {
            if let EventPayload::Degraded { component, .. } = event.payload
                && component == "bridge"
            {
                return true;
            }
        }
        false
    })
    .await;
    assert_eq!(degraded, Ok(true));

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn agent_directives_reach_the_body() {
    let gateway = Arc::new(MockGateway::default().reply(
        "wave at me",
        AgentReply {
            text: "Hello there!".to_string(),
            directives: vec![AgentDirective::PlayBehavior {
                name: "wave".to_string(),
            }],
        },
    ));
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(gateway, transport);
    let session = Session::start(config, deps).await.unwrap();

    script.user_says("wave at me");
    assert!(
        platform
            .wait_for(WAIT, |calls| behaviors(calls).contains(&"wave".to_string()))
            .await
    );

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_speech_provider_fails_start() {
    let (transport, _script) = scripted_transport();
    let (config, deps, _platform) =
        sim_session(Arc::new(MockGateway::default()), transport.refusing());
    let result = Session::start(config, deps).await;
    assert!(matches!(result, Err(BodyError::TransientIo { .. })));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_announces_close() {
    let (transport, _script) = scripted_transport();
    let (config, deps, _platform) = sim_session(Arc::new(MockGateway::default()), transport);
    let session = Session::start(config, deps).await.unwrap();
    let mut alerts = session.bus().subscribe_to(Topic::SystemAlerts);

    session.shutdown("operator request").await;

    let reason = tokio::time::timeout(WAIT, async {
        while let Some(event) = alerts.next_event().await {
            if let EventPayload::SessionClosed { reason } = event.payload {
                return reason;
            }
        }
        String::new()
    })
    .await
    .unwrap();
    assert_eq!(reason, "operator request");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn body_listens_then_thinks_until_the_reply() {
    let gateway = Arc::new(
        MockGateway::default()
            .reply("hello", reply("hi there"))
            .slow(Duration::from_millis(200)),
    );
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(gateway, transport);
    let session = Session::start(config, deps).await.unwrap();

    script.user_says("hello");
    assert!(
        platform
            .wait_for(WAIT, |calls| calls.iter().any(|c| matches!(
                c,
                PlatformCall::Executed(ActionTarget::HeadPose(pose)) if pose.pitch_rad > 0.0
            )))
            .await,
        "head lifts while the user talks"
    );
    assert!(
        platform
            .wait_for(WAIT, |calls| behaviors(calls) == vec!["thinking".to_string()])
            .await
    );
    assert!(
        platform
            .wait_for(WAIT, |calls| speech_chunks(calls) == AUDIO_CHUNKS_PER_REPLY)
            .await
    );

    let calls = platform.calls();
    let thinking = position(&calls, |c| {
        matches!(c, PlatformCall::Executed(ActionTarget::Behavior { name }) if name == "thinking")
    })
    .unwrap();
    let cleared = position(&calls, |c| matches!(c, PlatformCall::Stopped(Subsystem::Player)))
        .expect("thinking is cleared");
    let first_audio = position(&calls, |c| {
        matches!(c, PlatformCall::Executed(ActionTarget::SpeechAudio(_)))
    })
    .unwrap();
    assert!(thinking < cleared, "{calls:?}");
    assert!(cleared < first_audio, "{calls:?}");

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn superseded_reply_never_reaches_the_body() {
    let gateway = Arc::new(
        MockGateway::default()
            .reply(
                "wave at me",
                AgentReply {
                    text: "Hello there!".to_string(),
                    directives: vec![AgentDirective::PlayBehavior {
                        name: "wave".to_string(),
                    }],
                },
            )
            .reply("hello", reply("hi there"))
            .slow(Duration::from_millis(300)),
    );
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(Arc::clone(&gateway), transport);
    let session = Session::start(config, deps).await.unwrap();

    script.user_says("wave at me");
    tokio::time::sleep(Duration::from_millis(50)).await;
    script.user_says("hello");

    eventually("the second reply", || !script.spoken().is_empty()).await;
    assert!(
        platform
            .wait_for(WAIT, |calls| speech_chunks(calls) == AUDIO_CHUNKS_PER_REPLY)
            .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        *gateway.submitted.lock().unwrap(),
        vec!["wave at me".to_string(), "hello".to_string()]
    );
    assert_eq!(script.spoken(), vec!["hi there".to_string()]);
    assert!(!behaviors(&platform.calls()).contains(&"wave".to_string()));

    session.shutdown("test over").await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn barge_in_cuts_off_agent_audio() {
    let gateway = Arc::new(MockGateway::default().reply("hello", reply("hi there, how are you")));
    let (transport, script) = scripted_transport();
    let (config, deps, platform) = sim_session(gateway, transport.holding_audio());
    let session = Session::start(config, deps).await.unwrap();
    let mut conversation = session.bus().subscribe_to(Topic::Conversation);

    script.user_says("hello");
    assert!(
        platform
            .wait_for(WAIT, |calls| speech_chunks(calls) == 1)
            .await
    );

    script.starts_speaking();
    assert!(agent_turn_ended(&mut conversation).await, "agent turn is aborted");
    assert!(
        platform
            .wait_for(WAIT, |calls| calls
                .iter()
                .any(|c| matches!(c, PlatformCall::Stopped(Subsystem::Speaker))))
            .await
    );
    assert!(script.cancelled());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(speech_chunks(&platform.calls()), 1, "late audio is dropped");

    session.shutdown("test over").await;
}
