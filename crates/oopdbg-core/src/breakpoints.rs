//! Software breakpoint bookkeeping.
//!
//! The [`BreakpointTable`] tracks which addresses carry a trap instruction and
//! what code the trap replaced. The owning process does the actual patching
//! through its [`DebugApi`](crate::api::DebugApi); the table keeps the saved
//! original bytes authoritative so memory reads can show real code instead of
//! trap bytes.

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::error::{DebuggerError, Result};
use crate::types::{Address, Architecture};

/// x86 / x86-64 `INT3`.
pub const X86_INT3_INSTRUCTION: [u8; 1] = [0xCC];
/// ARM64 `BRK #0`, little-endian.
pub const ARM64_BRK_INSTRUCTION: [u8; 4] = [0x00, 0x00, 0x20, 0xD4];

/// Bytes replaced by a trap. Inline up to the largest trap we emit.
pub type InstructionBytes = SmallVec<[u8; 4]>;

/// Trap instruction used for software breakpoints on `architecture`.
pub fn trap_instruction(architecture: &Architecture) -> Result<&'static [u8]>
{
    match architecture {
        Architecture::X86 | Architecture::X86_64 => Ok(&X86_INT3_INSTRUCTION),
        Architecture::Arm64 => Ok(&ARM64_BRK_INSTRUCTION),
        Architecture::Unknown(label) => Err(DebuggerError::UnsupportedArchitecture(format!(
            "no software breakpoint instruction for {label}"
        ))),
    }
}

/// One patched instruction location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint
{
    address: Address,
    original_bytes: InstructionBytes,
    hit_count: u64,
}

impl Breakpoint
{
    pub(crate) fn new(address: Address, original_bytes: &[u8]) -> Self
    {
        Self {
            address,
            original_bytes: InstructionBytes::from_slice(original_bytes),
            hit_count: 0,
        }
    }

    /// Flat address of the trap instruction.
    pub fn address(&self) -> Address
    {
        self.address
    }

    /// Code the trap replaced.
    pub fn original_bytes(&self) -> &[u8]
    {
        &self.original_bytes
    }

    /// Number of breakpoint-hit exceptions reported at this address.
    pub fn hit_count(&self) -> u64
    {
        self.hit_count
    }

    fn len(&self) -> usize
    {
        self.original_bytes.len()
    }
}

/// Address-keyed breakpoint table (at most one entry per address)
///
/// Not synchronized; the owning process keeps it behind its state lock.
#[derive(Debug)]
pub struct BreakpointTable
{
    trap: InstructionBytes,
    by_address: BTreeMap<Address, Breakpoint>,
}

impl BreakpointTable
{
    /// Create an empty table for traps encoded as `trap`.
    pub fn new(trap: &[u8]) -> Self
    {
        Self {
            trap: InstructionBytes::from_slice(trap),
            by_address: BTreeMap::new(),
        }
    }

    /// Trap instruction written at each breakpoint.
    pub fn trap(&self) -> &[u8]
    {
        &self.trap
    }

    pub fn contains(&self, address: Address) -> bool
    {
        self.by_address.contains_key(&address)
    }

    pub fn get(&self, address: Address) -> Option<&Breakpoint>
    {
        self.by_address.get(&address)
    }

    /// All breakpoints in ascending address order.
    pub fn list(&self) -> Vec<Breakpoint>
    {
        self.by_address.values().cloned().collect()
    }

    pub fn len(&self) -> usize
    {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.by_address.is_empty()
    }

    /// Record a breakpoint whose trap has already been written.
    pub fn insert(&mut self, breakpoint: Breakpoint) -> Result<()>
    {
        if self.by_address.contains_key(&breakpoint.address) {
            return Err(DebuggerError::BreakpointExists(breakpoint.address));
        }
        self.by_address.insert(breakpoint.address, breakpoint);
        Ok(())
    }

    pub fn remove(&mut self, address: Address) -> Option<Breakpoint>
    {
        self.by_address.remove(&address)
    }

    /// Count a hit at `address`. Returns `false` if no breakpoint is there.
    pub fn record_hit(&mut self, address: Address) -> bool
    {
        match self.by_address.get_mut(&address) {
            Some(breakpoint) => {
                breakpoint.hit_count = breakpoint.hit_count.saturating_add(1);
                true
            }
            None => false,
        }
    }

    /// Forget every entry. The caller has already restored the original code.
    pub fn clear(&mut self)
    {
        self.by_address.clear();
    }

    /// Replace trap bytes in `buf` (read from `addr`) with the saved original code.
    pub fn mask_original(&self, addr: Address, buf: &mut [u8])
    {
        self.for_each_overlap(addr, buf.len(), |offset, breakpoint, index| {
            buf[offset] = breakpoint.original_bytes[index];
        });
    }

    /// Image to write for `data` at `addr`: bytes under an active breakpoint
    /// keep the trap so the breakpoint stays armed.
    pub fn patched_image(&self, addr: Address, data: &[u8]) -> Vec<u8>
    {
        let mut image = data.to_vec();
        let trap = &self.trap;
        self.for_each_overlap(addr, data.len(), |offset, _, index| {
            if let Some(byte) = trap.get(index) {
                image[offset] = *byte;
            }
        });
        image
    }

    /// Take `data` written at `addr` as the new original code under any
    /// overlapping breakpoint. Call only after the write succeeded.
    pub fn absorb_write(&mut self, addr: Address, data: &[u8])
    {
        let mut updates = Vec::new();
        self.for_each_overlap(addr, data.len(), |offset, breakpoint, index| {
            updates.push((breakpoint.address, index, data[offset]));
        });
        for (address, index, byte) in updates {
            if let Some(breakpoint) = self.by_address.get_mut(&address) {
                breakpoint.original_bytes[index] = byte;
            }
        }
    }

    /// Calls `f(offset_in_range, breakpoint, index_in_breakpoint)` for every
    /// breakpoint byte inside `[addr, addr + len)`.
    fn for_each_overlap<F>(&self, addr: Address, len: usize, mut f: F)
    where
        F: FnMut(usize, &Breakpoint, usize),
    {
        if len == 0 || self.by_address.is_empty() {
            return;
        }
        let reach = self.trap.len().saturating_sub(1) as u64;
        let first = Address::new(addr.value().saturating_sub(reach));
        let last = Address::new(addr.value().saturating_add(len as u64 - 1));
        for breakpoint in self.by_address.range(first..=last).map(|(_, bp)| bp) {
            for index in 0..breakpoint.len() {
                let Some(byte_addr) = breakpoint.address.checked_add(index as u64) else {
                    break;
                };
                if byte_addr.is_within(addr, len as u64) {
                    let offset = usize::try_from(byte_addr.value() - addr.value()).unwrap_or(usize::MAX);
                    if offset < len {
                        f(offset, breakpoint, index);
                    }
                }
            }
        }
    }
}
