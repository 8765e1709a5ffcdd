//! Session controller tests against fake device, engine and synthesizer

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use companion_relay::relay::{DeviceInbound, DeviceRelay};
use companion_relay::{Config, DeviceConfig, Error, Result, Session, SessionServices};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

mod common;
use common::{
    FakeConnector, FakeEngine, Recording, Script, ScriptedSynthesizer, default_payload, tagged,
    wait_until,
};

struct Harness {
    engine: FakeEngine,
    connector: Arc<FakeConnector>,
    synth: Arc<ScriptedSynthesizer>,
    recording: Recording,
    device: mpsc::Sender<DeviceInbound>,
    task: JoinHandle<Result<()>>,
}

fn device_config() -> DeviceConfig {
    DeviceConfig {
        voice_id: "voice-1".to_string(),
        system_prompt: "prompt".to_string(),
    }
}

fn spawn_session(
    config: Config,
    connector: &Arc<FakeConnector>,
    synth: &Arc<ScriptedSynthesizer>,
    recording: &Recording,
) -> (mpsc::Sender<DeviceInbound>, JoinHandle<Result<()>>) {
    let services = SessionServices {
        config: Arc::new(config),
        connector: connector.clone(),
        synthesizer: synth.clone(),
    };
    let relay = Arc::new(DeviceRelay::new("AABBCC", recording.sink()));
    let session = Session::new(&services, device_config(), relay).unwrap();

    let (device, inbound) = mpsc::channel(64);
    (device, tokio::spawn(session.run(inbound)))
}

async fn start_with(config: Config) -> Harness {
    let connector = FakeConnector::new();
    let mut engine = connector.accept();
    let synth = ScriptedSynthesizer::new();
    let recording = Recording::new();
    let (device, task) = spawn_session(config, &connector, &synth, &recording);

    let update = engine.recv_type("session.update").await;
    assert_eq!(update["session"]["instructions"], "prompt");

    Harness {
        engine,
        connector,
        synth,
        recording,
        device,
        task,
    }
}

async fn start() -> Harness {
    start_with(Config::default()).await
}

/// Wait until the device has been told to listen `n` times
async fn listening(recording: &Recording, n: usize) {
    let recording = recording.clone();
    wait_until("listening", move || {
        recording.events().iter().filter(|e| *e == "listening").count() >= n
    })
    .await;
}

impl Harness {
    async fn listening(&self, n: usize) {
        listening(&self.recording, n).await;
    }

    /// Play one full engine response
    async fn respond(&self, text: &str) {
        self.engine.emit("response.output_item.added").await;
        self.engine.delta(text).await;
        self.engine.emit("response.done").await;
    }

    async fn finish(self) -> Result<()> {
        tokio::time::timeout(common::WAIT, self.task)
            .await
            .expect("session did not end")
            .expect("session panicked")
    }
}

/// Every client event up to and including the first of `kind`
async fn events_until(engine: &mut FakeEngine, kind: &str) -> Vec<serde_json::Value> {
    let mut seen = Vec::new();
    loop {
        let event = engine
            .recv()
            .await
            .unwrap_or_else(|| panic!("link closed before {kind}"));
        let done = event["type"] == kind;
        seen.push(event);
        if done {
            return seen;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn one_turn_end_to_end() {
    let mut h = start().await;

    h.respond("こんにちは。").await;
    h.engine.recv_type("input_audio_buffer.clear").await;
    h.listening(1).await;

    let calls = h.synth.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].text, "こんにちは。");
    assert_eq!(calls[0].voice_id, "voice-1");

    let starts = h.recording.controls("audio_start");
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0]["sample_rate"], 44_100);
    assert_eq!(starts[0]["format"], "pcm");

    let timeline = h.recording.timeline();
    assert_eq!(timeline.first().map(String::as_str), Some("audio_start"));
    assert_eq!(
        &timeline[timeline.len() - 3..],
        &[
            "audio_end".to_string(),
            "response".to_string(),
            "listening".to_string()
        ]
    );
    assert!(
        timeline[1..timeline.len() - 3].iter().all(|e| e == "frame"),
        "{timeline:?}"
    );
    assert_eq!(h.recording.controls("response")[0]["text"], "こんにちは。");
    assert_eq!(h.recording.audio(), default_payload("こんにちは。").to_vec());
    assert!(h.recording.frames().iter().all(|f| f.len() <= 512));
}

#[tokio::test(start_paused = true)]
async fn multi_sentence_reply_keeps_order_and_flushes_tail() {
    let mut h = start().await;

    h.engine.emit("response.output_item.added").await;
    for delta in ["ひとつめ", "。ふたつ", "めです！みっつ"] {
        h.engine.delta(delta).await;
    }
    h.engine.emit("response.done").await;
    h.engine.recv_type("input_audio_buffer.clear").await;
    h.listening(1).await;

    assert_eq!(h.synth.texts(), vec!["ひとつめ。", "ふたつめです！", "みっつ"]);
    let expected: Vec<u8> = ["ひとつめ。", "ふたつめです！", "みっつ"]
        .iter()
        .flat_map(|t| default_payload(t).to_vec())
        .collect();
    assert_eq!(h.recording.audio(), expected);
    assert_eq!(h.recording.controls("audio_start").len(), 1);

    let replies = h.recording.controls("response");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["text"], "ひとつめ。ふたつめです！みっつ");
}

#[tokio::test(start_paused = true)]
async fn device_audio_is_forwarded_only_while_listening() {
    let mut h = start().await;

    h.device
        .send(DeviceInbound::Audio(Bytes::from_static(b"before")))
        .await
        .unwrap();
    let append = h.engine.recv_type("input_audio_buffer.append").await;
    assert_eq!(append["audio"], STANDARD.encode(b"before"));

    h.synth.script(
        "ながい文。",
        Script {
            chunks: (0..10).map(|_| tagged(b'L', 512)).collect(),
            chunk_delay: Duration::from_millis(50),
            ..Script::default()
        },
    );
    h.engine.emit("response.output_item.added").await;
    h.engine.delta("ながい文。").await;
    let recording = h.recording.clone();
    wait_until("audio_start", move || !recording.controls("audio_start").is_empty()).await;

    h.device
        .send(DeviceInbound::Audio(Bytes::from_static(b"during")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    h.engine.emit("response.done").await;
    h.listening(1).await;

    h.device
        .send(DeviceInbound::Audio(Bytes::from_static(b"after")))
        .await
        .unwrap();
    let append = h.engine.recv_type("input_audio_buffer.append").await;
    assert_eq!(append["audio"], STANDARD.encode(b"after"));
}

#[tokio::test(start_paused = true)]
async fn conversation_window_deletes_oldest_items() {
    let mut h = start().await;

    for id in ["i1", "i2", "i3"] {
        h.engine.item_created(id).await;
    }
    // Flush the session's outbound traffic with a turn end
    h.engine.emit("response.done").await;

    let seen = events_until(&mut h.engine, "input_audio_buffer.clear").await;
    let deleted: Vec<&str> = seen
        .iter()
        .filter(|e| e["type"] == "conversation.item.delete")
        .filter_map(|e| e["item_id"].as_str())
        .collect();
    assert_eq!(deleted, vec!["i1"]);
}

#[tokio::test(start_paused = true)]
async fn user_speech_interrupts_playback() {
    let mut h = start().await;
    h.synth.script(
        "はじめの文。",
        Script {
            chunks: (0..50).map(|_| tagged(b'A', 600)).collect(),
            chunk_delay: Duration::from_millis(20),
            ..Script::default()
        },
    );

    h.engine.emit("response.output_item.added").await;
    h.engine.delta("はじめの文。つぎの文。").await;
    let recording = h.recording.clone();
    wait_until("first frame", move || !recording.frames().is_empty()).await;

    h.engine.emit("input_audio_buffer.speech_started").await;
    h.engine.recv_type("response.cancel").await;
    h.listening(1).await;
    let frames = h.recording.frames().len();

    // Tail of the cancelled response is ignored
    h.engine.delta("きえる文。").await;
    h.engine.emit("response.done").await;
    h.engine.recv_type("input_audio_buffer.clear").await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.recording.frames().len(), frames);
    assert!(h.recording.audio().iter().all(|b| *b == b'A'));

    let timeline = h.recording.timeline();
    let tail: Vec<&str> = timeline[timeline.len() - 2..]
        .iter()
        .map(String::as_str)
        .collect();
    assert_eq!(tail, vec!["audio_end", "listening"]);

    // The next response plays normally
    h.respond("あたらしい文。").await;
    h.listening(2).await;

    assert_eq!(h.synth.texts(), vec!["はじめの文。", "あたらしい文。"]);

    // Only the completed turn's text is echoed
    let replies = h.recording.controls("response");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0]["text"], "あたらしい文。");
    assert!(
        h.recording
            .audio()
            .ends_with(&default_payload("あたらしい文。"))
    );
    assert_eq!(h.recording.controls("audio_start").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn speech_while_listening_does_not_cancel() {
    let mut h = start().await;

    h.engine.emit("input_audio_buffer.speech_started").await;
    h.engine.emit("response.done").await;

    let seen = events_until(&mut h.engine, "input_audio_buffer.clear").await;
    assert!(seen.iter().all(|e| e["type"] != "response.cancel"));
    assert!(h.recording.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnects_once_with_same_instructions() {
    let mut h = start().await;
    let mut second = h.connector.accept();

    h.engine.item_created("i1").await;
    h.engine.item_created("i2").await;
    drop(h.engine);

    let update = second.recv_type("session.update").await;
    assert_eq!(update["session"]["instructions"], "prompt");
    assert_eq!(h.connector.attempts(), 2);

    // Items from the old connection no longer count toward the window
    second.item_created("j1").await;
    second.item_created("j2").await;
    second.emit("response.done").await;
    let seen = events_until(&mut second, "input_audio_buffer.clear").await;
    assert!(seen.iter().all(|e| e["type"] != "conversation.item.delete"));

    second.emit("response.output_item.added").await;
    second.delta("もどったよ。").await;
    second.emit("response.done").await;
    listening(&h.recording, 1).await;
    assert_eq!(h.synth.texts(), vec!["もどったよ。"]);
    assert!(!h.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn failed_reconnect_ends_session_with_error() {
    let h = start().await;

    let Harness {
        engine,
        connector,
        recording,
        task,
        device: _device,
        ..
    } = h;
    drop(engine);

    let result = tokio::time::timeout(common::WAIT, task)
        .await
        .expect("session did not end")
        .expect("session panicked");
    assert!(matches!(result, Err(Error::UpstreamConnect(_))));
    assert_eq!(connector.attempts(), 2);

    let errors = recording.controls("error");
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["message"].as_str().is_some_and(|m| !m.is_empty()));
    assert!(recording.is_closed());
}

#[tokio::test(start_paused = true)]
async fn engine_dropping_reconnected_link_ends_session() {
    let h = start().await;
    let mut second = h.connector.accept();
    let _spare = h.connector.accept();

    let Harness {
        engine,
        connector,
        recording,
        task,
        device: _device,
        ..
    } = h;
    drop(engine);
    second.recv_type("session.update").await;
    drop(second);

    let result = tokio::time::timeout(common::WAIT, task)
        .await
        .expect("session did not end")
        .expect("session panicked");
    assert!(matches!(result, Err(Error::UpstreamConnect(_))));
    assert_eq!(connector.attempts(), 2);
    assert_eq!(recording.controls("error").len(), 1);
    assert!(recording.is_closed());
}

#[tokio::test(start_paused = true)]
async fn initial_connect_failure_notifies_device() {
    let connector = FakeConnector::new();
    let synth = ScriptedSynthesizer::new();
    let recording = Recording::new();
    let (_device, task) = spawn_session(Config::default(), &connector, &synth, &recording);

    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::UpstreamConnect(_))));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(recording.events(), vec!["error"]);
    assert!(recording.is_closed());
}

#[tokio::test(start_paused = true)]
async fn filler_phrase_plays_before_reply() {
    let mut config = Config::default();
    config.conversation.aizuchi = vec!["うん。".to_string()];
    let mut h = start_with(config).await;
    h.synth.script(
        "うん。",
        Script {
            chunks: vec![tagged(b'U', 600)],
            open_delay: Duration::from_millis(30),
            ..Script::default()
        },
    );
    h.synth.script(
        "こたえ。",
        Script {
            chunks: vec![tagged(b'K', 300)],
            ..Script::default()
        },
    );

    h.engine.emit("input_audio_buffer.speech_stopped").await;
    h.respond("こたえ。").await;
    h.engine.recv_type("input_audio_buffer.clear").await;
    h.listening(1).await;

    assert_eq!(h.synth.texts(), vec!["うん。", "こたえ。"]);
    assert_eq!(h.recording.controls("audio_start").len(), 1);

    let mut expected = vec![b'U'; 600];
    expected.extend(vec![b'K'; 300]);
    assert_eq!(h.recording.audio(), expected);

    // The filler phrase is not part of the echoed reply
    assert_eq!(h.recording.controls("response")[0]["text"], "こたえ。");
}

#[tokio::test(start_paused = true)]
async fn reconnect_closes_filler_only_turn() {
    let mut config = Config::default();
    config.conversation.aizuchi = vec!["うん。".to_string()];
    let h = start_with(config).await;
    let mut second = h.connector.accept();

    h.engine.emit("input_audio_buffer.speech_stopped").await;
    let recording = h.recording.clone();
    wait_until("audio_start", move || !recording.controls("audio_start").is_empty()).await;

    let Harness {
        engine,
        recording,
        device,
        task,
        ..
    } = h;
    drop(engine);
    second.recv_type("session.update").await;

    // The filler turn ends even though no response will follow it
    listening(&recording, 1).await;
    assert_eq!(recording.audio(), default_payload("うん。").to_vec());
    assert!(recording.controls("response").is_empty());

    device
        .send(DeviceInbound::Audio(Bytes::from_static(b"again")))
        .await
        .unwrap();
    let append = second.recv_type("input_audio_buffer.append").await;
    assert_eq!(append["audio"], STANDARD.encode(b"again"));
    assert!(!task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn transcription_is_echoed_to_device() {
    let h = start().await;

    h.engine
        .send(serde_json::json!({
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "やあ"
        }))
        .await;

    let recording = h.recording.clone();
    wait_until("transcription", move || {
        !recording.controls("transcription").is_empty()
    })
    .await;
    assert_eq!(h.recording.controls("transcription")[0]["text"], "やあ");
}

#[tokio::test(start_paused = true)]
async fn engine_errors_do_not_end_session() {
    let mut h = start().await;

    h.engine
        .send(serde_json::json!({
            "type": "error",
            "error": { "code": "item_not_found", "message": "no such item" }
        }))
        .await;
    h.respond("だいじょうぶ。").await;
    h.engine.recv_type("input_audio_buffer.clear").await;
    h.listening(1).await;

    assert!(h.recording.controls("error").is_empty());
    assert!(!h.task.is_finished());
}

#[tokio::test(start_paused = true)]
async fn device_disconnect_ends_session_cleanly() {
    let mut h = start().await;

    h.device.send(DeviceInbound::Closed).await.unwrap();
    assert!(h.engine.recv().await.is_none());

    let recording = h.recording.clone();
    h.finish().await.unwrap();
    assert!(recording.is_closed());
}

#[tokio::test(start_paused = true)]
async fn device_failure_mid_playback_ends_session() {
    let connector = FakeConnector::new();
    let mut engine = connector.accept();
    let synth = ScriptedSynthesizer::new();
    let recording = Recording::failing_after(1);
    let (_device, task) = spawn_session(Config::default(), &connector, &synth, &recording);
    engine.recv_type("session.update").await;

    engine.emit("response.output_item.added").await;
    engine.delta("こんにちは。").await;

    let result = tokio::time::timeout(common::WAIT, task)
        .await
        .expect("session did not end")
        .expect("session panicked");
    assert!(result.is_ok());
    assert_eq!(recording.frames().len(), 1);
    assert!(engine.recv().await.is_none());
}
