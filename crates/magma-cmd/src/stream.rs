//! # Command Stream
//!
//! Append-only recording of command packets with in-place patching.
//!
//! Offsets handed out by [`CommandStream::emit`] are dword indices into the
//! stream. They stay valid until the stream is cleared and are the only
//! handle later code needs to rewrite a recorded packet.

use alloc::vec::Vec;

use magma_core::{Error, GpuAddr, Result};

use crate::decode::{decode, Command};
use crate::packet::{Branch, BranchFlags, ConditionalBranch, Packet};

/// Recorded command stream
#[derive(Debug, Clone)]
pub struct CommandStream {
    /// GPU address of dword 0
    base: GpuAddr,
    /// Recorded dwords
    dwords: Vec<u32>,
    /// Capacity limit in dwords
    limit: Option<usize>,
}

impl CommandStream {
    /// Create an unbounded stream starting at `base`
    pub fn new(base: GpuAddr) -> Self {
        Self {
            base,
            dwords: Vec::new(),
            limit: None,
        }
    }

    /// Create a stream holding at most `max_dwords`
    pub fn with_limit(base: GpuAddr, max_dwords: usize) -> Self {
        Self {
            base,
            dwords: Vec::with_capacity(max_dwords),
            limit: Some(max_dwords),
        }
    }

    /// GPU address of the first dword
    #[inline]
    pub fn base(&self) -> GpuAddr {
        self.base
    }

    /// Recorded length in dwords
    #[inline]
    pub fn len(&self) -> usize {
        self.dwords.len()
    }

    /// Whether nothing has been recorded
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.dwords.is_empty()
    }

    /// Recorded dwords
    #[inline]
    pub fn dwords(&self) -> &[u32] {
        &self.dwords
    }

    /// GPU address of the dword at `offset`
    #[inline]
    pub fn gpu_addr_at(&self, offset: usize) -> GpuAddr {
        self.base + offset as u64 * 4
    }

    /// GPU address the next packet will be recorded at
    #[inline]
    pub fn current_addr(&self) -> GpuAddr {
        self.gpu_addr_at(self.dwords.len())
    }

    /// Record a packet, returning its dword offset
    pub fn emit<P: Packet>(&mut self, packet: P) -> Result<usize> {
        let offset = self.dwords.len();
        if let Some(limit) = self.limit {
            if offset + P::DWORDS > limit {
                return Err(Error::CommandBufferFull);
            }
        }
        self.dwords
            .extend_from_slice(bytemuck::cast_slice(core::slice::from_ref(&packet)));
        Ok(offset)
    }

    /// Read back the packet recorded at `offset`
    pub fn packet<P: Packet>(&self, offset: usize) -> Result<&P> {
        let words = self
            .dwords
            .get(offset..offset + P::DWORDS)
            .ok_or(Error::TruncatedCommand)?;
        if words.first() != Some(&P::header()) {
            return Err(Error::InvalidCommand);
        }
        bytemuck::try_from_bytes(bytemuck::cast_slice(words)).map_err(|_| Error::InvalidCommand)
    }

    /// Mutable access to the packet recorded at `offset`
    pub fn packet_mut<P: Packet>(&mut self, offset: usize) -> Result<&mut P> {
        let words = self
            .dwords
            .get_mut(offset..offset + P::DWORDS)
            .ok_or(Error::TruncatedCommand)?;
        if words.first() != Some(&P::header()) {
            return Err(Error::InvalidCommand);
        }
        bytemuck::try_from_bytes_mut(bytemuck::cast_slice_mut(words))
            .map_err(|_| Error::InvalidCommand)
    }

    /// Drop everything recorded
    pub fn clear(&mut self) {
        self.dwords.clear();
    }

    /// Drop everything recorded past `len` dwords
    pub fn truncate(&mut self, len: usize) {
        self.dwords.truncate(len);
    }

    /// Move the recording to a buffer at `base` holding `max_dwords`
    ///
    /// Branches that target the recorded range follow it to the new base.
    pub fn relocate(&mut self, base: GpuAddr, max_dwords: usize) -> Result<()> {
        if max_dwords < self.dwords.len() {
            return Err(Error::InvalidArgument);
        }
        let old_base = self.base;
        let end = self.current_addr();
        let moved = |target: GpuAddr| {
            (target >= old_base && target <= end).then(|| base + (target - old_base))
        };

        for decoded in decode(&self.dwords, old_base)? {
            match decoded.command {
                Command::Branch(branch) => {
                    if let Some(target) = moved(branch.target()) {
                        self.packet_mut::<Branch>(decoded.offset)?.set_target(target);
                    }
                }
                Command::ConditionalBranch(branch) => {
                    if branch.flags().contains(BranchFlags::INDIRECT_TARGET) {
                        continue;
                    }
                    if let Some(target) = moved(branch.target()) {
                        self.packet_mut::<ConditionalBranch>(decoded.offset)?
                            .set_target(target);
                    }
                }
                _ => {}
            }
        }

        self.base = base;
        self.limit = Some(max_dwords);
        self.dwords.reserve(max_dwords - self.dwords.len());
        Ok(())
    }
}
