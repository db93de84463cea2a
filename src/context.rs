//! Compilation-unit state shared by every function.
//!
//! The broadcast buffer, the cooperative reduction buffer and the global
//! reduction lock are single symbols per unit. Each function only ever
//! grows their recorded size and alignment; the declarations are emitted
//! once, after the last function.

use std::fmt;

use crate::ptx::PtxStateSpace;

/// Symbol of the shared-memory broadcast buffer
pub const BROADCAST_SYMBOL: &str = "__simt_bcast";
/// Symbol of the shared-memory cooperative reduction buffer
pub const REDUCTION_SYMBOL: &str = "__simt_red";
/// Symbol of the global reduction lock cell
pub const LOCK_SYMBOL: &str = "__simt_reduction_lock";

/// A module-level buffer with a running maximum size and alignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedBuffer {
    symbol: &'static str,
    space: PtxStateSpace,
    size: u32,
    align: u32,
}

impl SharedBuffer {
    const fn new(symbol: &'static str, space: PtxStateSpace) -> Self {
        Self {
            symbol,
            space,
            size: 0,
            align: 0,
        }
    }

    /// Record a requirement; never shrinks
    pub fn grow(&mut self, size: u32, align: u32) {
        self.size = self.size.max(size);
        self.align = self.align.max(align);
    }

    /// Symbol name
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        self.symbol
    }

    /// Largest size requested so far
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    /// Largest alignment requested so far
    #[must_use]
    pub const fn align(&self) -> u32 {
        self.align
    }

    /// True once any function used the buffer
    #[must_use]
    pub const fn is_used(&self) -> bool {
        self.size > 0
    }

    fn declaration(&self) -> Option<BufferDecl> {
        if !self.is_used() {
            return None;
        }
        let align = self.align.max(1);
        Some(BufferDecl {
            symbol: self.symbol,
            space: self.space,
            align,
            size: self.size.div_ceil(align) * align,
        })
    }
}

/// Final declaration of a used buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDecl {
    /// Symbol name
    pub symbol: &'static str,
    /// State space
    pub space: PtxStateSpace,
    /// Alignment in bytes
    pub align: u32,
    /// Size in bytes, a multiple of `align`
    pub size: u32,
}

impl fmt::Display for BufferDecl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} .align {} .u8 {}[{}];",
            self.space, self.align, self.symbol, self.size
        )
    }
}

/// State threaded through every function of one compilation unit
#[derive(Debug, Clone)]
pub struct CodegenContext {
    /// Broadcast buffer for cooperative state propagation
    pub broadcast: SharedBuffer,
    /// Cooperative-axis reduction buffer
    pub reduction: SharedBuffer,
    /// Lock cell serialising lock-based reduction updates
    pub lock: SharedBuffer,
    functions: usize,
}

impl CodegenContext {
    /// Fresh context for a new compilation unit
    #[must_use]
    pub const fn new() -> Self {
        Self {
            broadcast: SharedBuffer::new(BROADCAST_SYMBOL, PtxStateSpace::Shared),
            reduction: SharedBuffer::new(REDUCTION_SYMBOL, PtxStateSpace::Shared),
            lock: SharedBuffer::new(LOCK_SYMBOL, PtxStateSpace::Global),
            functions: 0,
        }
    }

    /// Count a processed function
    pub fn record_function(&mut self) {
        self.functions += 1;
    }

    /// Functions processed so far
    #[must_use]
    pub const fn functions(&self) -> usize {
        self.functions
    }

    /// Declarations of every buffer some function needed
    #[must_use]
    pub fn finalize(&self) -> Vec<BufferDecl> {
        let decls: Vec<BufferDecl> = [&self.broadcast, &self.reduction, &self.lock]
            .into_iter()
            .filter_map(SharedBuffer::declaration)
            .collect();
        tracing::debug!(
            functions = self.functions,
            declarations = decls.len(),
            broadcast_bytes = self.broadcast.size(),
            reduction_bytes = self.reduction.size(),
            "finalized unit buffers"
        );
        decls
    }
}

impl Default for CodegenContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unused_context_declares_nothing() {
        let ctx = CodegenContext::new();
        assert!(ctx.finalize().is_empty());
        assert_eq!(ctx.broadcast.size(), 0);
    }

    #[test]
    fn test_grow_keeps_maximum() {
        let mut ctx = CodegenContext::new();
        ctx.broadcast.grow(12, 4);
        ctx.broadcast.grow(8, 8);
        assert_eq!(ctx.broadcast.size(), 12);
        assert_eq!(ctx.broadcast.align(), 8);
    }

    #[test]
    fn test_declaration_rounds_to_alignment() {
        let mut ctx = CodegenContext::new();
        ctx.broadcast.grow(12, 8);
        ctx.lock.grow(4, 4);

        let decls = ctx.finalize();
        assert_eq!(decls.len(), 2);
        assert_eq!(decls[0].size, 16);
        assert_eq!(
            decls[0].to_string(),
            ".shared .align 8 .u8 __simt_bcast[16];"
        );
        assert_eq!(decls[1].space, PtxStateSpace::Global);
    }
}
