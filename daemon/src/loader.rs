//! eBPF program loader
//!
//! Defines the boundary between the probe session and whatever loads
//! bytecode into the kernel, and provides the aya-backed implementation.

use crate::error::{AttachError, ChannelError, PollError};
use crate::types::RawRecord;
use aya::{
    maps::{
        perf::{PerfEventArray, PerfEventArrayBuffer},
        MapData,
    },
    programs::{KProbe, ProgramError},
    util::online_cpus,
    Bpf,
};
use bytes::BytesMut;
use log::{debug, info, warn};
use std::{borrow::Cow, path::PathBuf};
use tcprecv_common::constants::{DEFAULT_KERNEL_SYMBOL, PROGRAM_NAME, RECORD_SIZE};

/// Number of records read from one CPU buffer per `read_events` call
const READ_BATCH: usize = 16;

/// Default per-CPU perf buffer size in pages
pub const DEFAULT_PERF_PAGES: usize = 64;

/// Loads probe bytecode, attaches it, and opens its event buffers
pub trait ProbeLoader {
    /// Loaded object, keeps attached programs alive until dropped
    type Handle;
    /// Open kernel event buffer
    type Buffer: RecordBuffer;

    /// Parse and load a probe object
    fn load(&mut self, bytecode: &[u8]) -> Result<Self::Handle, AttachError>;

    /// Attach `program_name` from the object to a kernel function entry
    fn attach_kprobe(
        &mut self,
        handle: &mut Self::Handle,
        kernel_symbol: &str,
        program_name: &str,
    ) -> Result<(), AttachError>;

    /// Open the named perf event map
    fn open_perf_buffer(
        &mut self,
        handle: &mut Self::Handle,
        name: &str,
    ) -> Result<Self::Buffer, ChannelError>;
}

/// Kernel buffer that can be drained on demand
pub trait RecordBuffer {
    /// Drain every currently available record
    ///
    /// `on_record` runs synchronously once per record, in buffer order
    /// for each CPU. Records from different CPUs are not ordered.
    fn poll(&mut self, on_record: &mut dyn FnMut(RawRecord<'_>)) -> Result<PollSummary, PollError>;
}

/// Outcome of one drain
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    /// Records handed to the callback
    pub records: usize,
    /// Records the kernel reported as overwritten before we read them
    pub lost: usize,
}

/// Where the probe bytecode comes from
#[derive(Debug, Clone)]
pub enum ProbeObject {
    /// Compiled object on disk
    Path(PathBuf),
    /// Object baked into the binary
    Embedded(&'static [u8]),
}

impl ProbeObject {
    /// Object compiled into the agent with the `embedded` feature
    #[cfg(feature = "embedded")]
    pub fn embedded() -> Self {
        Self::Embedded(aya::include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/../kernel/target/bpfel-unknown-none/release/tcprecv-probe"
        )))
    }

    /// Read the bytecode
    pub fn bytecode(&self) -> Result<Cow<'static, [u8]>, AttachError> {
        match self {
            Self::Path(path) => {
                info!("Loading eBPF object from: {:?}", path);
                std::fs::read(path).map(Cow::Owned).map_err(|e| {
                    AttachError::LoadFailed(format!("cannot read {}: {}", path.display(), e))
                })
            }
            Self::Embedded(data) => {
                info!("Loading embedded eBPF object...");
                Ok(Cow::Borrowed(*data))
            }
        }
    }
}

/// Everything needed to attach the probe
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub object: ProbeObject,
    /// Program name inside the object
    pub program: String,
    /// Kernel function to attach to
    pub kernel_symbol: String,
}

impl ProbeTarget {
    /// Target the default receive-path probe in `object`
    pub fn tcp_recv(object: ProbeObject) -> Self {
        Self {
            object,
            program: PROGRAM_NAME.to_string(),
            kernel_symbol: DEFAULT_KERNEL_SYMBOL.to_string(),
        }
    }
}

/// Aya-backed probe loader
#[derive(Debug, Clone)]
pub struct AyaLoader {
    perf_pages: usize,
}

impl Default for AyaLoader {
    fn default() -> Self {
        Self::new(DEFAULT_PERF_PAGES)
    }
}

impl AyaLoader {
    /// Create a loader opening `perf_pages` pages per CPU buffer
    ///
    /// The page count must be a power of two.
    pub fn new(perf_pages: usize) -> Self {
        Self { perf_pages }
    }
}

/// Loaded eBPF object
pub struct AyaProbe {
    bpf: Bpf,
}

impl ProbeLoader for AyaLoader {
    type Handle = AyaProbe;
    type Buffer = AyaPerfBuffer;

    fn load(&mut self, bytecode: &[u8]) -> Result<AyaProbe, AttachError> {
        bump_memlock_rlimit();

        let bpf = Bpf::load(bytecode)
            .map_err(|e| AttachError::LoadFailed(format!("invalid eBPF object: {}", e)))?;
        info!("eBPF program loaded successfully");

        Ok(AyaProbe { bpf })
    }

    fn attach_kprobe(
        &mut self,
        handle: &mut AyaProbe,
        kernel_symbol: &str,
        program_name: &str,
    ) -> Result<(), AttachError> {
        info!("Attaching {} to {}...", program_name, kernel_symbol);

        let program: &mut KProbe = handle
            .bpf
            .program_mut(program_name)
            .ok_or_else(|| {
                AttachError::LoadFailed(format!("{} program not found in eBPF object", program_name))
            })?
            .try_into()
            .map_err(|e: ProgramError| {
                AttachError::LoadFailed(format!("{} is not a kprobe: {}", program_name, e))
            })?;

        program
            .load()
            .map_err(|e| AttachError::LoadFailed(format!("kernel rejected {}: {}", program_name, e)))?;

        program
            .attach(kernel_symbol, 0)
            .map_err(|e| AttachError::AttachFailed {
                program: program_name.to_string(),
                symbol: kernel_symbol.to_string(),
                reason: e.to_string(),
            })?;
        info!("  ✓ Attached to {}", kernel_symbol);

        Ok(())
    }

    fn open_perf_buffer(
        &mut self,
        handle: &mut AyaProbe,
        name: &str,
    ) -> Result<AyaPerfBuffer, ChannelError> {
        let open_failed = |reason: String| ChannelError::OpenFailed {
            name: name.to_string(),
            reason,
        };

        let map = handle
            .bpf
            .take_map(name)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))?;

        let mut perf_array = PerfEventArray::try_from(map).map_err(|e| open_failed(e.to_string()))?;

        let cpus = online_cpus().map_err(|e| open_failed(format!("cannot list online CPUs: {:?}", e)))?;
        info!("Opening {} perf buffers for {} CPUs", name, cpus.len());

        let mut buffers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let buf = perf_array
                .open(cpu, Some(self.perf_pages))
                .map_err(|e| open_failed(format!("CPU {}: {}", cpu, e)))?;
            buffers.push((cpu, buf));
        }

        Ok(AyaPerfBuffer {
            buffers,
            scratch: (0..READ_BATCH)
                .map(|_| BytesMut::with_capacity(RECORD_SIZE))
                .collect(),
        })
    }
}

/// Per-CPU perf buffers of one event map
pub struct AyaPerfBuffer {
    buffers: Vec<(u32, PerfEventArrayBuffer<MapData>)>,
    scratch: Vec<BytesMut>,
}

impl RecordBuffer for AyaPerfBuffer {
    fn poll(&mut self, on_record: &mut dyn FnMut(RawRecord<'_>)) -> Result<PollSummary, PollError> {
        let mut summary = PollSummary::default();

        for (cpu, buf) in self.buffers.iter_mut() {
            while buf.readable() {
                let events = buf
                    .read_events(&mut self.scratch)
                    .map_err(|e| PollError::ReadFailed {
                        cpu: *cpu,
                        reason: e.to_string(),
                    })?;

                for data in self.scratch.iter().take(events.read) {
                    on_record(RawRecord::new(*cpu, data));
                }

                summary.records += events.read;
                summary.lost += events.lost;

                if events.read == 0 && events.lost == 0 {
                    break;
                }
            }
        }

        if summary.records > 0 {
            debug!("Drained {} records ({} lost)", summary.records, summary.lost);
        }

        Ok(summary)
    }
}

/// Lift the locked-memory limit so maps can be created on older kernels
///
/// Non-fatal if it fails.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!("Failed to increase memlock rlimit");
    }
}
