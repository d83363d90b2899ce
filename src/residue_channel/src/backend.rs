use crate::{ResidueResult, Word};

/// Which kernel a backend was compiled with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelRole {
    /// Fills workgroup memory from the message prefix of the global buffer.
    Writer,
    /// Dumps workgroup memory as found into the global buffer.
    Listener,
}

impl KernelRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Writer => "writer",
            Self::Listener => "listener",
        }
    }
}

/// Launch shape of one dispatch. The global buffer holds one
/// `local_memory_words` slice per workgroup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchGeometry {
    pub workgroup_count: u32,
    pub threads_per_workgroup: u32,
    pub local_memory_words: u32,
}

impl DispatchGeometry {
    pub fn buffer_words(&self) -> usize {
        self.workgroup_count as usize * self.local_memory_words as usize
    }

    pub fn local_memory_bytes(&self) -> u64 {
        u64::from(self.local_memory_words) * std::mem::size_of::<Word>() as u64
    }
}

/// A session-scoped compute backend: device, kernel and buffers are created
/// up front and owned for the backend's lifetime.
///
/// The driver only ever has one call outstanding.
pub trait ComputeBackend: Send {
    fn role(&self) -> KernelRole;

    fn geometry(&self) -> DispatchGeometry;

    /// Replaces the whole global buffer and the message-length parameter
    /// before the next dispatch. Only meaningful for the writer kernel.
    fn reinitialize(&mut self, buffer: &[Word], message_len: usize) -> ResidueResult<()>;

    /// Runs one dispatch and blocks until the device reports completion.
    fn dispatch(&mut self) -> ResidueResult<()>;

    /// Contents of the global buffer after the last dispatch.
    fn read_buffer(&mut self) -> ResidueResult<Vec<Word>>;
}

impl<B: ComputeBackend + ?Sized> ComputeBackend for Box<B> {
    fn role(&self) -> KernelRole {
        (**self).role()
    }

    fn geometry(&self) -> DispatchGeometry {
        (**self).geometry()
    }

    fn reinitialize(&mut self, buffer: &[Word], message_len: usize) -> ResidueResult<()> {
        (**self).reinitialize(buffer, message_len)
    }

    fn dispatch(&mut self) -> ResidueResult<()> {
        (**self).dispatch()
    }

    fn read_buffer(&mut self) -> ResidueResult<Vec<Word>> {
        (**self).read_buffer()
    }
}
