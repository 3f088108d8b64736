//! Keyboard stand-in for the realtime speech provider.
//!
//! Each line typed on stdin becomes one complete user utterance.  Replies are
//! printed and rendered as a short synthetic waveform so the body still
//! sways while "talking".

use std::collections::VecDeque;
use std::io::BufRead;

use async_trait::async_trait;
use clawbody_middleware::{ClientCommand, ProviderEvent, SpeechTransport};
use clawbody_types::BodyError;
use colored::Colorize;
use tokio::sync::mpsc;
use tracing::debug;

/// 20 ms at 24 kHz.
const CHUNK_SAMPLES: usize = 480;
const CHUNKS_PER_WORD: usize = 10;
const TONE_HZ: f32 = 180.0;

#[derive(Default)]
pub struct ConsoleTransport {
    lines: Option<mpsc::UnboundedReceiver<String>>,
    queued: VecDeque<ProviderEvent>,
}

impl ConsoleTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
        debug!("stdin closed");
    });
    rx
}

/// The provider events for one typed utterance; blank lines produce none.
pub(crate) fn utterance_events(line: &str) -> Vec<ProviderEvent> {
    let text = line.trim();
    if text.is_empty() {
        return Vec::new();
    }
    vec![
        ProviderEvent::SpeechStarted,
        ProviderEvent::UserTranscriptDelta(format!("{text} ")),
        ProviderEvent::SpeechStopped,
        ProviderEvent::UserTranscriptCompleted(text.to_string()),
    ]
}

/// A syllable-shaped tone burst per word, loud on long words.
pub(crate) fn synthesize(text: &str) -> Vec<Vec<i16>> {
    let mut chunks = Vec::new();
    let mut phase = 0usize;
    for word in text.split_whitespace() {
        let peak = (2_000 + 1_500 * word.chars().count().min(8)) as f32;
        for i in 0..CHUNKS_PER_WORD {
            let envelope = (std::f32::consts::PI * (i as f32 + 0.5) / CHUNKS_PER_WORD as f32).sin();
            let chunk = (0..CHUNK_SAMPLES)
                .map(|_| {
                    let t = phase as f32 / clawbody_types::SPEECH_SAMPLE_RATE as f32;
                    phase += 1;
                    (peak * envelope * (2.0 * std::f32::consts::PI * TONE_HZ * t).sin()) as i16
                })
                .collect();
            chunks.push(chunk);
        }
    }
    chunks
}

pub(crate) fn response_events(text: &str) -> Vec<ProviderEvent> {
    let mut events = vec![ProviderEvent::ResponseCreated];
    events.extend(synthesize(text).into_iter().map(ProviderEvent::AudioDelta));
    events.push(ProviderEvent::AgentTranscriptDone(text.to_string()));
    events.push(ProviderEvent::ResponseDone);
    events
}

#[async_trait]
impl SpeechTransport for ConsoleTransport {
    async fn connect(&mut self) -> Result<(), BodyError> {
        if self.lines.is_none() {
            self.lines = Some(spawn_stdin_reader());
            println!("  {}", "Type to talk to the robot; Ctrl-C to quit.".dimmed());
        }
        Ok(())
    }

    async fn send(&mut self, command: ClientCommand) -> Result<(), BodyError> {
        match command {
            ClientCommand::Speak(text) => {
                println!("{} {}", "robot ›".cyan().bold(), text);
                self.queued.extend(response_events(&text));
            }
            ClientCommand::CancelResponse => {
                self.queued
                    .retain(|e| !matches!(e, ProviderEvent::AudioDelta(_)));
                println!("{}", "  (interrupted)".dimmed());
            }
            ClientCommand::AppendAudio(_) => {}
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ProviderEvent>, BodyError> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }
        let Some(lines) = self.lines.as_mut() else {
            return Err(BodyError::InvalidState("console not connected".into()));
        };
        loop {
            match lines.recv().await {
                Some(line) => {
                    let mut events = utterance_events(&line).into_iter();
                    if let Some(first) = events.next() {
                        self.queued.extend(events);
                        return Ok(Some(first));
                    }
                }
                // Closed stdin leaves the session running until Ctrl-C.
                None => std::future::pending::<()>().await,
            }
        }
    }

    async fn close(&mut self) -> Result<(), BodyError> {
        self.queued.clear();
        Ok(())
    }
}
