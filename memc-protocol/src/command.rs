//! The wire-independent parsed command, shared by the text and binary engines.

/// The set of operations either engine can produce. `Malformed` and `Unsupported`
/// are not real client intents; they carry a parse failure or an out-of-scope binary
/// opcode through to dispatch so the engine can reply without aborting the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Get,
    Delete,
    Touch,
    Quit,
    Stats,
    Version,
    Malformed,
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub op: Op,
    pub keys: Vec<Vec<u8>>,
    pub flags: u32,
    pub exptime: u32,
    pub noreply: bool,
    pub body: Vec<u8>,
    pub opaque: Option<u32>,
    pub cas: u64,
}

impl Command {
    pub fn new(op: Op) -> Self {
        Command {
            op,
            keys: Vec::new(),
            flags: 0,
            exptime: 0,
            noreply: false,
            body: Vec::new(),
            opaque: None,
            cas: 0,
        }
    }

    pub fn malformed() -> Self {
        Self::new(Op::Malformed)
    }

    /// The primary key for single-key operations. Empty slice if none was parsed.
    pub fn key(&self) -> &[u8] {
        self.keys.first().map(|k| k.as_slice()).unwrap_or(&[])
    }
}
