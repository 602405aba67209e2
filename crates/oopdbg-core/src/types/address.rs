//! Memory address type.

use std::fmt;
use std::ops::{Add, Sub};

/// Strongly typed address in the debuggee's flat (linear) address space
///
/// Sandbox-relative pointers are carried as `Address` too; converting one into
/// a flat address is the job of
/// [`Debuggee::nexe_to_flat_address`](crate::process::Debuggee::nexe_to_flat_address).
///
/// ## Example
///
/// ```rust
/// use oopdbg_core::types::Address;
///
/// let addr = Address::from(0x1000);
/// let next_addr = addr + 0x100;
/// assert_eq!(next_addr.value(), 0x1100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address
{
    /// The null address. Used as "not set" for the nexe base and entry point.
    pub const ZERO: Self = Address(0);

    /// Create a new address from a `u64` value in const contexts.
    pub const fn new(value: u64) -> Self
    {
        Address(value)
    }

    /// Get the raw `u64` value of this address
    pub const fn value(self) -> u64
    {
        self.0
    }

    /// Returns `true` for the null address.
    pub const fn is_zero(self) -> bool
    {
        self.0 == 0
    }

    /// Add an offset to this address, checking for overflow
    ///
    /// ```rust
    /// use oopdbg_core::types::Address;
    ///
    /// let addr = Address::from(0x1000);
    /// assert_eq!(addr.checked_add(0x100), Some(Address::from(0x1100)));
    /// assert_eq!(addr.checked_add(u64::MAX), None);
    /// ```
    pub fn checked_add(self, offset: u64) -> Option<Self>
    {
        self.0.checked_add(offset).map(Address)
    }

    /// Subtract an offset from this address, checking for underflow
    pub fn checked_sub(self, offset: u64) -> Option<Self>
    {
        self.0.checked_sub(offset).map(Address)
    }

    /// End of the half-open range `[self, self + len)`, or `None` when the
    /// range wraps past the top of the address space.
    pub fn range_end(self, len: usize) -> Option<Self>
    {
        self.checked_add(len as u64)
    }

    /// Whether `self` lies in the half-open range `[start, start + len)`.
    pub fn is_within(self, start: Address, len: u64) -> bool
    {
        self.0 >= start.0 && self.0 - start.0 < len
    }
}

impl From<u64> for Address
{
    fn from(value: u64) -> Self
    {
        Address(value)
    }
}

impl From<Address> for u64
{
    fn from(address: Address) -> Self
    {
        address.0
    }
}

impl fmt::Display for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "0x{:016x}", self.0)
    }
}

impl fmt::LowerHex for Address
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl Add<u64> for Address
{
    type Output = Address;

    fn add(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_add(rhs))
    }
}

impl Sub<u64> for Address
{
    type Output = Address;

    fn sub(self, rhs: u64) -> Self::Output
    {
        Address(self.0.wrapping_sub(rhs))
    }
}
