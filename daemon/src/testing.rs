//! In-memory probe loader for tests
//!
//! Records are queued by the test and drained by `poll`; the journal
//! counts live probe and buffer handles so tests can check release.

use crate::error::{AttachError, ChannelError, PollError};
use crate::loader::{PollSummary, ProbeLoader, ProbeObject, ProbeTarget, RecordBuffer};
use crate::types::RawRecord;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tcprecv_common::RecvRecord;

/// Shared view into what the fake loader did
#[derive(Default)]
pub(crate) struct Journal {
    pub records: VecDeque<(u32, Vec<u8>)>,
    pub fail_next_poll: bool,
    /// Overrun count reported by the next poll
    pub lost: usize,
    pub probes_alive: usize,
    pub buffers_alive: usize,
    pub attached: Vec<(String, String)>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeLoader {
    pub journal: Arc<Mutex<Journal>>,
    pub refuse_attach: bool,
}

pub(crate) struct FakeProbe(Arc<Mutex<Journal>>);

impl Drop for FakeProbe {
    fn drop(&mut self) {
        self.0.lock().unwrap().probes_alive -= 1;
    }
}

pub(crate) struct FakeBuffer(Arc<Mutex<Journal>>);

impl Drop for FakeBuffer {
    fn drop(&mut self) {
        self.0.lock().unwrap().buffers_alive -= 1;
    }
}

impl RecordBuffer for FakeBuffer {
    fn poll(&mut self, on_record: &mut dyn FnMut(RawRecord<'_>)) -> Result<PollSummary, PollError> {
        let (drained, lost): (Vec<_>, usize) = {
            let mut journal = self.0.lock().unwrap();
            if journal.fail_next_poll {
                return Err(PollError::ReadFailed {
                    cpu: 0,
                    reason: "buffer torn down".into(),
                });
            }
            let lost = std::mem::take(&mut journal.lost);
            (journal.records.drain(..).collect(), lost)
        };

        for (cpu, data) in &drained {
            on_record(RawRecord::new(*cpu, data));
        }

        Ok(PollSummary {
            records: drained.len(),
            lost,
        })
    }
}

impl ProbeLoader for FakeLoader {
    type Handle = FakeProbe;
    type Buffer = FakeBuffer;

    fn load(&mut self, bytecode: &[u8]) -> Result<FakeProbe, AttachError> {
        if bytecode.is_empty() {
            return Err(AttachError::LoadFailed("empty object".into()));
        }
        self.journal.lock().unwrap().probes_alive += 1;
        Ok(FakeProbe(Arc::clone(&self.journal)))
    }

    fn attach_kprobe(
        &mut self,
        _handle: &mut FakeProbe,
        kernel_symbol: &str,
        program_name: &str,
    ) -> Result<(), AttachError> {
        if self.refuse_attach {
            return Err(AttachError::AttachFailed {
                program: program_name.into(),
                symbol: kernel_symbol.into(),
                reason: "operation not permitted".into(),
            });
        }
        self.journal
            .lock()
            .unwrap()
            .attached
            .push((kernel_symbol.into(), program_name.into()));
        Ok(())
    }

    fn open_perf_buffer(
        &mut self,
        _handle: &mut FakeProbe,
        name: &str,
    ) -> Result<FakeBuffer, ChannelError> {
        if name != "EVENTS" {
            return Err(ChannelError::NotFound(name.into()));
        }
        self.journal.lock().unwrap().buffers_alive += 1;
        Ok(FakeBuffer(Arc::clone(&self.journal)))
    }
}

/// Probe target whose bytecode the fake loader accepts
pub(crate) fn fake_target() -> ProbeTarget {
    ProbeTarget::tcp_recv(ProbeObject::Embedded(b"\x7fELF"))
}

/// Queue one well-formed record
pub(crate) fn push_record(loader: &FakeLoader, cpu: u32, pid: u32, bytes: u64) {
    loader
        .journal
        .lock()
        .unwrap()
        .records
        .push_back((cpu, RecvRecord { pid, bytes }.to_le_bytes().to_vec()));
}

/// Queue arbitrary bytes
pub(crate) fn push_raw(loader: &FakeLoader, cpu: u32, data: &[u8]) {
    loader
        .journal
        .lock()
        .unwrap()
        .records
        .push_back((cpu, data.to_vec()));
}
