//! In-memory doubles for the channel and sink seams

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::consumer::channel::{close_signal, wait_closed};
use crate::consumer::{Batch, ChannelCloser, Diagnostic, EventChannel, LatencySample, LatencySink};
use crate::domain::ChannelError;

/// Shared, ordered record of teardown steps
pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn encode_record(pid: u32, tid: u32, latency_ns: u64) -> Vec<u8> {
    let key = (u64::from(pid) << 32) | u64::from(tid);
    let mut bytes = key.to_le_bytes().to_vec();
    bytes.extend_from_slice(&latency_ns.to_le_bytes());
    bytes
}

/// Write a relocatable x86-64 ELF whose `.text` holds one function, `name`
pub fn write_elf_fixture(dir: &Path, name: &str, code: &[u8]) -> PathBuf {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let value = obj.append_section_data(text, code, 16);
    obj.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });

    let path = dir.join(format!("{name}.o"));
    std::fs::write(&path, obj.write().unwrap()).unwrap();
    path
}

/// Replays scripted reads, then blocks until closed
pub struct ScriptedChannel {
    script: VecDeque<Result<Batch, ChannelError>>,
    close_when_drained: bool,
    closed: watch::Receiver<bool>,
    closer: ChannelCloser,
    log: Option<EventLog>,
}

impl ScriptedChannel {
    pub fn new(script: Vec<Result<Batch, ChannelError>>) -> Self {
        let (closer, closed) = close_signal();
        Self { script: script.into(), close_when_drained: false, closed, closer, log: None }
    }

    /// Behave as if closed by a listener once the script runs out
    pub fn close_when_drained(&mut self) {
        self.close_when_drained = true;
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }
}

impl EventChannel for ScriptedChannel {
    async fn read_batch(&mut self) -> Result<Batch, ChannelError> {
        if !*self.closed.borrow() {
            if let Some(step) = self.script.pop_front() {
                return step;
            }
            if self.close_when_drained {
                self.closer.close();
            }
        }

        wait_closed(&mut self.closed).await;
        if let Some(log) = &self.log {
            log.lock().unwrap().push("consumer stopped".to_string());
        }
        Err(ChannelError::Closed)
    }

    fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub samples: Vec<LatencySample>,
    pub diagnostics: Vec<Diagnostic>,
    pub finished: bool,
}

impl LatencySink for RecordingSink {
    fn sample(&mut self, sample: &LatencySample) {
        self.samples.push(*sample);
    }

    fn diagnostic(&mut self, diagnostic: &Diagnostic) {
        self.diagnostics.push(diagnostic.clone());
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}
