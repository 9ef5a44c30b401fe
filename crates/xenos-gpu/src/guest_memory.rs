//! Guest physical memory as seen by the GPU.
//!
//! Shared memory reads through this trait when it uploads pages to the host
//! buffer. The CPU emulator owns the real implementation.

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("guest memory access out of bounds: gpa=0x{gpa:08x} len=0x{len:x} size=0x{size:x}")]
pub struct GuestMemoryError {
    pub gpa: u64,
    pub len: usize,
    pub size: u64,
}

pub trait GuestMemory: Send + Sync {
    /// Size of the addressable physical range in bytes.
    fn size(&self) -> u64;

    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError>;
}

/// Flat in-process guest memory, mostly for tests and tools.
#[derive(Debug)]
pub struct VecGuestMemory {
    bytes: std::sync::RwLock<Vec<u8>>,
}

impl VecGuestMemory {
    pub fn new(size: usize) -> Self {
        Self {
            bytes: std::sync::RwLock::new(vec![0u8; size]),
        }
    }

    pub fn write(&self, gpa: u64, src: &[u8]) -> Result<(), GuestMemoryError> {
        let mut bytes = self.bytes.write().unwrap_or_else(|e| e.into_inner());
        let size = bytes.len() as u64;
        let range = checked_range(gpa, src.len(), size)?;
        bytes[range].copy_from_slice(src);
        Ok(())
    }
}

fn checked_range(
    gpa: u64,
    len: usize,
    size: u64,
) -> Result<std::ops::Range<usize>, GuestMemoryError> {
    let err = GuestMemoryError { gpa, len, size };
    let end = gpa.checked_add(len as u64).ok_or(err)?;
    if end > size {
        return Err(err);
    }
    Ok(gpa as usize..end as usize)
}

impl GuestMemory for VecGuestMemory {
    fn size(&self) -> u64 {
        self.bytes.read().map(|b| b.len()).unwrap_or_else(|e| e.into_inner().len()) as u64
    }

    fn read(&self, gpa: u64, dst: &mut [u8]) -> Result<(), GuestMemoryError> {
        let bytes = self.bytes.read().unwrap_or_else(|e| e.into_inner());
        let range = checked_range(gpa, dst.len(), bytes.len() as u64)?;
        dst.copy_from_slice(&bytes[range]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_written_bytes() {
        let mem = VecGuestMemory::new(0x100);
        mem.write(0x10, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 4];
        mem.read(0x10, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3, 4]);
    }

    #[test]
    fn out_of_bounds_is_reported() {
        let mem = VecGuestMemory::new(0x100);
        let mut out = [0u8; 8];
        let err = mem.read(0xFC, &mut out).unwrap_err();
        assert_eq!(err.gpa, 0xFC);
        assert_eq!(err.size, 0x100);
    }
}
