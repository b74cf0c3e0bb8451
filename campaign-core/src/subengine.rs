//! The `SubEngine` seam (§4.9): the on-disk container format and streaming
//! dataplanes are out of scope (§1) but the rest of this crate needs a
//! concrete interface to route reads through. `MemorySubEngine` is the one
//! implementation shipped here, standing in for a real container-format
//! engine in tests and in the local-open path.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::EngineError;

/// The standard element types a variable or attribute may hold (§4.7);
/// struct-typed entries are not representable and are skipped by the
/// namespace merger rather than appearing here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Complex32,
    Complex64,
    String,
}

impl ElementType {
    /// Size in bytes of one element, used to size destination buffers for
    /// remote Get requests. `String` has no fixed size; callers must not
    /// rely on this for string variables.
    pub fn element_size(self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 | ElementType::Complex32 => 8,
            ElementType::Complex64 => 16,
            ElementType::String => 0,
        }
    }
}

/// Whether a `Get` should be serviced immediately or flushed later by
/// `PerformGets` (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Sync,
    Deferred,
}

/// `BeginStep`'s result (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Ok,
    EndOfStream,
    NotReady,
    OtherError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInfo {
    pub name: String,
    pub element_type: ElementType,
    pub shape: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo {
    pub name: String,
    pub element_type: ElementType,
    pub shape: Vec<u64>,
}

/// One block of one variable at one step: the unit `BlocksInfo` reports.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockInfo {
    pub block_id: u64,
    pub start: Vec<u64>,
    pub count: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MinMax {
    pub min: Vec<u8>,
    pub max: Vec<u8>,
}

/// The caller-visible half of a `Get`'s promise. For `ReadMode::Sync` the
/// value is already sent by the time this is returned; for
/// `ReadMode::Deferred` nothing fulfils it until the owning sub-engine's
/// `perform_gets` (or `close`) runs. Mirrors
/// [`crate::transport::RequestHandle`] so a deferred read can survive past
/// the single `get` call that created it without borrowing the caller's
/// destination buffer.
pub struct ReadHandle {
    rx: oneshot::Receiver<Result<Vec<u8>, EngineError>>,
}

impl ReadHandle {
    pub fn new(rx: oneshot::Receiver<Result<Vec<u8>, EngineError>>) -> Self {
        Self { rx }
    }

    /// Blocks until the read is fulfilled. A sender dropped without ever
    /// sending (e.g. the sub-engine closed with this read still pending) is
    /// surfaced as [`EngineError::Closed`], never a panic.
    pub async fn wait(self) -> Result<Vec<u8>, EngineError> {
        self.rx.await.unwrap_or(Err(EngineError::Closed))
    }
}

/// The black-box interface the rest of this crate consumes in place of a
/// real container-format/streaming engine (§1, §4.9). `FederatedEngine`
/// holds one of these per dataset and routes every merged-namespace
/// operation to it.
#[async_trait]
pub trait SubEngine: Send + Sync {
    /// Opens whatever backing store this sub-engine wraps. `MemorySubEngine`
    /// is always already populated, so its `open` is a no-op; a real
    /// container-format engine would read headers/metadata here.
    async fn open(&self) -> Result<(), EngineError>;

    fn available_variables(&self) -> Vec<VariableInfo>;
    fn available_attributes(&self) -> Vec<AttributeInfo>;

    /// Starts a read and returns a handle to its eventual bytes rather than
    /// writing into a caller-supplied buffer: a `Deferred` read's value
    /// isn't known until a later, separate `perform_gets` call, and a
    /// borrowed `&mut [u8]` cannot be held open across that gap. `Sync`
    /// reads fulfil the handle before this returns.
    async fn get(&self, name: &str, mode: ReadMode) -> Result<ReadHandle, EngineError>;
    async fn perform_gets(&self) -> Result<(), EngineError>;

    fn shape(&self, name: &str) -> Option<Vec<u64>>;
    fn min_max(&self, name: &str) -> Option<MinMax>;
    fn blocks_info(&self, name: &str, step: u64) -> Vec<BlockInfo>;
    fn all_steps_blocks_info(&self, name: &str) -> BTreeMap<u64, Vec<BlockInfo>>;
    fn all_relative_steps_blocks_info(&self, name: &str) -> Vec<Vec<BlockInfo>>;
    fn expr_str(&self, name: &str) -> String;

    async fn close(&self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
struct StoredVariable {
    info: VariableInfo,
    data: Vec<u8>,
    blocks: Vec<BlockInfo>,
}

/// A `SubEngine` that serves variables/attributes out of memory. Used by
/// the local-open path (files materialized by `CacheLayout` are decoded
/// into it by whatever real container-format crate is linked in) and
/// directly by tests.
#[derive(Default)]
pub struct MemorySubEngine {
    variables: Mutex<BTreeMap<String, StoredVariable>>,
    attributes: Mutex<BTreeMap<String, (AttributeInfo, Vec<u8>)>>,
    /// Name and promise of every `Deferred` read not yet flushed by
    /// `perform_gets`.
    pending: Mutex<Vec<(String, oneshot::Sender<Result<Vec<u8>, EngineError>>)>>,
}

impl MemorySubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(self, info: VariableInfo, data: Vec<u8>) -> Self {
        self.add_variable(info, data, vec![]);
        self
    }

    pub fn add_variable(&self, info: VariableInfo, data: Vec<u8>, blocks: Vec<BlockInfo>) {
        let blocks = if blocks.is_empty() {
            vec![BlockInfo {
                block_id: 0,
                start: vec![0; info.shape.len()],
                count: info.shape.clone(),
            }]
        } else {
            blocks
        };
        self.variables.lock().unwrap().insert(
            info.name.clone(),
            StoredVariable { info, data, blocks },
        );
    }

    pub fn with_attribute(self, info: AttributeInfo, data: Vec<u8>) -> Self {
        self.attributes
            .lock()
            .unwrap()
            .insert(info.name.clone(), (info, data));
        self
    }
}

#[async_trait]
impl SubEngine for MemorySubEngine {
    async fn open(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn available_variables(&self) -> Vec<VariableInfo> {
        self.variables
            .lock()
            .unwrap()
            .values()
            .map(|v| v.info.clone())
            .collect()
    }

    fn available_attributes(&self) -> Vec<AttributeInfo> {
        self.attributes
            .lock()
            .unwrap()
            .values()
            .map(|(info, _)| info.clone())
            .collect()
    }

    async fn get(&self, name: &str, mode: ReadMode) -> Result<ReadHandle, EngineError> {
        let (tx, rx) = oneshot::channel();
        match mode {
            ReadMode::Sync => {
                let data = self.snapshot(name)?;
                let _ = tx.send(Ok(data));
            }
            ReadMode::Deferred => {
                // Fail the call itself on an unknown name instead of
                // queuing a promise that can never be fulfilled.
                self.snapshot(name)?;
                self.pending.lock().unwrap().push((name.to_string(), tx));
            }
        }
        Ok(ReadHandle::new(rx))
    }

    async fn perform_gets(&self) -> Result<(), EngineError> {
        // A real sub-engine would fan out pending reads to its own I/O
        // layer here; the in-memory store already holds everything, so
        // re-reading it per pending name and fulfilling each promise is
        // enough.
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        for (name, tx) in pending {
            let _ = tx.send(self.snapshot(&name));
        }
        Ok(())
    }

    fn shape(&self, name: &str) -> Option<Vec<u64>> {
        self.variables
            .lock()
            .unwrap()
            .get(name)
            .map(|v| v.info.shape.clone())
    }

    fn min_max(&self, name: &str) -> Option<MinMax> {
        let vars = self.variables.lock().unwrap();
        let v = vars.get(name)?;
        let elem = v.info.element_type.element_size().max(1);
        if v.data.len() < elem {
            return None;
        }
        let mut min = v.data[0..elem].to_vec();
        let mut max = v.data[0..elem].to_vec();
        for chunk in v.data.chunks(elem) {
            if chunk < min.as_slice() {
                min = chunk.to_vec();
            }
            if chunk > max.as_slice() {
                max = chunk.to_vec();
            }
        }
        Some(MinMax { min, max })
    }

    fn blocks_info(&self, name: &str, _step: u64) -> Vec<BlockInfo> {
        self.variables
            .lock()
            .unwrap()
            .get(name)
            .map(|v| v.blocks.clone())
            .unwrap_or_default()
    }

    fn all_steps_blocks_info(&self, name: &str) -> BTreeMap<u64, Vec<BlockInfo>> {
        let blocks = self.blocks_info(name, 0);
        let mut out = BTreeMap::new();
        if !blocks.is_empty() {
            out.insert(0, blocks);
        }
        out
    }

    fn all_relative_steps_blocks_info(&self, name: &str) -> Vec<Vec<BlockInfo>> {
        let blocks = self.blocks_info(name, 0);
        if blocks.is_empty() {
            vec![]
        } else {
            vec![blocks]
        }
    }

    fn expr_str(&self, _name: &str) -> String {
        String::new()
    }

    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

impl MemorySubEngine {
    fn snapshot(&self, name: &str) -> Result<Vec<u8>, EngineError> {
        self.variables
            .lock()
            .unwrap()
            .get(name)
            .map(|v| v.data.clone())
            .ok_or_else(|| EngineError::NameNotFound(name.to_string()))
    }
}
