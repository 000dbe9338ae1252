//! Remote addresses as values.
//!
//! A [`Symbol`] is a 64-bit remote address plus a handle to the client that
//! can dereference it. Arithmetic never touches the network: every operator
//! wraps at 64 bits and produces a new `Symbol` bound to the same client.
//! Methods that do talk to the agent are `async` and say so in their name
//! (`peek`, `poke`, `read_word`, `write_word`, `call`).
//!
//! A `Symbol` never owns the memory it points to. Use an
//! [`AllocationGuard`](crate::guard::AllocationGuard) for that.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Deref, DerefMut};

use bytes::Bytes;

use crate::client::Client;
use crate::error::{RpcError, Result};
use crate::marshal::{Arg, ReturnKind, ReturnValue};

/// Default width of indexed access.
pub const DEFAULT_ITEM_SIZE: usize = 8;

/// Remote pointer with arithmetic and dereference.
#[derive(Clone)]
pub struct Symbol {
    address: u64,
    item_size: usize,
    client: Client,
}

impl Symbol {
    pub(crate) fn new(address: u64, client: Client) -> Self {
        Self {
            address,
            item_size: DEFAULT_ITEM_SIZE,
            client,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Width in bytes of one indexed element.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// Change the indexed access width. Must be 1, 2, 4 or 8.
    pub fn set_item_size(&mut self, size: usize) -> Result<()> {
        check_item_size(size)?;
        self.item_size = size;
        Ok(())
    }

    /// Temporarily change the item size. The previous size comes back when
    /// the returned guard drops, on every exit path.
    pub fn with_item_size(&mut self, size: usize) -> Result<ItemSizeGuard<'_>> {
        check_item_size(size)?;
        let previous = std::mem::replace(&mut self.item_size, size);
        Ok(ItemSizeGuard {
            symbol: self,
            previous,
        })
    }

    /// New symbol at `address` on the same client, same item size.
    fn rebind(&self, address: u64) -> Symbol {
        Symbol {
            address,
            item_size: self.item_size,
            client: self.client.clone(),
        }
    }

    /// Signed pointer offset.
    pub fn offset(&self, delta: i64) -> Symbol {
        self.rebind(self.address.wrapping_add(delta as u64))
    }

    fn element_address(&self, index: i64) -> u64 {
        self.address
            .wrapping_add((index as u64).wrapping_mul(self.item_size as u64))
    }

    /// Read `size` bytes at this address.
    pub async fn peek(&self, size: u64) -> Result<Bytes> {
        self.client.peek(self.address, size).await
    }

    /// Write `data` at this address.
    pub async fn poke(&self, data: impl Into<Bytes>) -> Result<()> {
        self.client.poke(self.address, data.into()).await
    }

    /// Read the NUL-terminated string at this address.
    pub async fn peek_str(&self) -> Result<String> {
        self.client.peek_str(self.address).await
    }

    /// Read element `index` (`item_size` bytes, little-endian, unsigned).
    pub async fn read_word(&self, index: i64) -> Result<Symbol> {
        let addr = self.element_address(index);
        let raw = self.client.peek(addr, self.item_size as u64).await?;
        let mut word = [0u8; 8];
        word[..raw.len()].copy_from_slice(&raw);
        Ok(self.client.symbol(u64::from_le_bytes(word)))
    }

    /// Write element `index`, truncating `value` to `item_size` bytes.
    pub async fn write_word(&self, index: i64, value: u64) -> Result<()> {
        let addr = self.element_address(index);
        let bytes = value.to_le_bytes();
        self.client
            .poke(addr, Bytes::copy_from_slice(&bytes[..self.item_size]))
            .await
    }

    /// Call the function at this address; the result is a new symbol.
    pub async fn call(&self, args: Vec<Arg>) -> Result<Symbol> {
        self.client.call(self.address, args).await
    }

    /// Call and decode the return value as `kind`.
    pub async fn call_with(&self, args: Vec<Arg>, kind: ReturnKind) -> Result<ReturnValue> {
        self.client.call_with(self.address, args, kind).await
    }

    /// `self / rhs`, or `None` when `rhs` is zero.
    pub fn checked_div(&self, rhs: u64) -> Option<Symbol> {
        self.address.checked_div(rhs).map(|a| self.rebind(a))
    }

    /// `self % rhs`, or `None` when `rhs` is zero.
    pub fn checked_rem(&self, rhs: u64) -> Option<Symbol> {
        self.address.checked_rem(rhs).map(|a| self.rebind(a))
    }
}

fn check_item_size(size: usize) -> Result<()> {
    match size {
        1 | 2 | 4 | 8 => Ok(()),
        other => Err(RpcError::Argument(format!(
            "item size must be 1, 2, 4 or 8, got {other}"
        ))),
    }
}

/// Restores a symbol's item size on drop.
pub struct ItemSizeGuard<'a> {
    symbol: &'a mut Symbol,
    previous: usize,
}

impl Deref for ItemSizeGuard<'_> {
    type Target = Symbol;

    fn deref(&self) -> &Symbol {
        self.symbol
    }
}

impl DerefMut for ItemSizeGuard<'_> {
    fn deref_mut(&mut self) -> &mut Symbol {
        self.symbol
    }
}

impl Drop for ItemSizeGuard<'_> {
    fn drop(&mut self) {
        self.symbol.item_size = self.previous;
    }
}

macro_rules! symbol_op {
    ($($(#[$doc:meta])* $trait:ident :: $method:ident => $op:expr;)*) => {
        $(
            impl std::ops::$trait<u64> for &Symbol {
                type Output = Symbol;

                $(#[$doc])*
                fn $method(self, rhs: u64) -> Symbol {
                    let op: fn(u64, u64) -> u64 = $op;
                    self.rebind(op(self.address, rhs))
                }
            }

            impl std::ops::$trait<u64> for Symbol {
                type Output = Symbol;

                $(#[$doc])*
                fn $method(self, rhs: u64) -> Symbol {
                    std::ops::$trait::$method(&self, rhs)
                }
            }
        )*
    };
}

symbol_op! {
    Add::add => u64::wrapping_add;
    Sub::sub => u64::wrapping_sub;
    Mul::mul => u64::wrapping_mul;
    /// # Panics
    ///
    /// When `rhs` is zero, as with `u64`. See [`Symbol::checked_div`].
    Div::div => u64::wrapping_div;
    /// # Panics
    ///
    /// When `rhs` is zero, as with `u64`. See [`Symbol::checked_rem`].
    Rem::rem => u64::wrapping_rem;
    BitAnd::bitand => |a, b| a & b;
    BitOr::bitor => |a, b| a | b;
    BitXor::bitxor => |a, b| a ^ b;
    Shl::shl => |a, b| a.wrapping_shl(b as u32);
    Shr::shr => |a, b| a.wrapping_shr(b as u32);
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for Symbol {}

impl PartialEq<u64> for Symbol {
    fn eq(&self, other: &u64) -> bool {
        self.address == *other
    }
}

impl PartialOrd for Symbol {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Symbol {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.address.cmp(&other.address)
    }
}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
    }
}

impl From<&Symbol> for u64 {
    fn from(s: &Symbol) -> u64 {
        s.address
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:#x})", self.address)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

impl fmt::LowerHex for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.address, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    fn sym(addr: u64) -> Symbol {
        Client::lazy(ClientConfig::default()).symbol(addr)
    }

    #[tokio::test]
    async fn test_arithmetic_wraps() {
        let s = sym(u64::MAX);
        assert_eq!((&s + 1).address(), 0);
        assert_eq!((sym(0) - 1).address(), u64::MAX);
        assert_eq!((sym(0x10) * 0x10).address(), 0x100);
        assert_eq!((sym(0x1234) & 0xff00).address(), 0x1200);
        assert_eq!((sym(0x1000) | 0x1).address(), 0x1001);
        assert_eq!((sym(0xff) ^ 0x0f).address(), 0xf0);
        assert_eq!((sym(0x101) / 0x10).address(), 0x10);
        assert_eq!((sym(0x101) % 0x10).address(), 1);
        assert_eq!(sym(0x2000).offset(-0x10).address(), 0x1ff0);
    }

    #[tokio::test]
    async fn test_checked_division_by_zero() {
        let mut s = sym(0x101);
        s.set_item_size(4).unwrap();
        assert_eq!(s.checked_div(0x10).unwrap().address(), 0x10);
        assert_eq!(s.checked_rem(0x10).unwrap().item_size(), 4);
        assert!(s.checked_div(0).is_none());
        assert!(s.checked_rem(0).is_none());
    }

    #[tokio::test]
    async fn test_arithmetic_keeps_item_size() {
        let mut s = sym(0x4000);
        s.set_item_size(4).unwrap();
        let t = &s + 8;
        assert_eq!(t.item_size(), 4);
        assert_eq!(s.address(), 0x4000);
    }

    #[tokio::test]
    async fn test_item_size_guard_restores() {
        let mut s = sym(0x4000);
        {
            let g = s.with_item_size(2).unwrap();
            assert_eq!(g.item_size(), 2);
        }
        assert_eq!(s.item_size(), DEFAULT_ITEM_SIZE);

        let failed: Result<()> = (|| {
            let _g = s.with_item_size(1)?;
            Err(RpcError::Argument("inner".into()))
        })();
        assert!(failed.is_err());
        assert_eq!(s.item_size(), DEFAULT_ITEM_SIZE);

        assert!(s.with_item_size(3).is_err());
        assert!(s.set_item_size(16).is_err());
    }

    #[tokio::test]
    async fn test_element_address() {
        let mut s = sym(0x1000);
        assert_eq!(s.element_address(3), 0x1018);
        s.set_item_size(2).unwrap();
        assert_eq!(s.element_address(-1), 0xffe);
    }

    #[tokio::test]
    async fn test_peek_null_rejected_locally() {
        let err = sym(0).peek(8).await.unwrap_err();
        assert!(matches!(err, RpcError::Argument(_)));
    }

    #[tokio::test]
    async fn test_formatting_and_equality() {
        let s = sym(0xdead);
        assert_eq!(s.to_string(), "0xdead");
        assert_eq!(format!("{s:?}"), "Symbol(0xdead)");
        assert_eq!(format!("{s:x}"), "dead");
        assert_eq!(s, 0xdead);
        assert!(sym(1) < sym(2));
    }
}
