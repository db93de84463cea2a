//! PTX Emission Utilities
//!
//! Renders the IR as PTX-like text. Marker and reduction pseudo
//! instructions print as comments so dumps stay readable between passes.

use std::fmt::{self, Write as _};

use super::cfg::Function;
use super::instructions::{MarkerKind, Operand, PtxInstruction, PtxOp};

/// PTX emitter configuration
#[derive(Debug, Clone, Default)]
pub struct EmitConfig {
    /// Print `// bbN` headers before each block
    pub block_headers: bool,
    /// Print region markers as comments
    pub show_markers: bool,
}

impl EmitConfig {
    /// Create a new emit configuration
    #[must_use]
    pub const fn new() -> Self {
        Self {
            block_headers: true,
            show_markers: true,
        }
    }

    /// Drop block headers
    #[must_use]
    pub const fn without_block_headers(mut self) -> Self {
        self.block_headers = false;
        self
    }

    /// Drop marker comments
    #[must_use]
    pub const fn without_markers(mut self) -> Self {
        self.show_markers = false;
        self
    }
}

/// Emit a function body
#[must_use]
pub fn emit_function(func: &Function, config: &EmitConfig) -> String {
    let mut out = String::new();
    let _ = writeln!(out, ".func {}() {{", func.name());
    out.push_str(&func.registers().emit_declarations());
    for &block in func.layout() {
        if config.block_headers {
            let _ = writeln!(out, "  // {}", block);
        }
        for &insn in func.insns(block) {
            let insn = func.insn(insn);
            if !config.show_markers && insn.as_marker().is_some() {
                continue;
            }
            let _ = writeln!(out, "    {}", insn);
        }
    }
    out.push_str("}\n");
    out
}

fn mnemonic(op: &PtxOp) -> &'static str {
    match op {
        PtxOp::Add => "add",
        PtxOp::Sub => "sub",
        PtxOp::Mul => "mul",
        PtxOp::Min => "min",
        PtxOp::Max => "max",
        PtxOp::Setp => "setp",
        PtxOp::And => "and",
        PtxOp::Or => "or",
        PtxOp::Xor => "xor",
        PtxOp::Shr => "shr",
        PtxOp::Mov | PtxOp::Unpack | PtxOp::Pack => "mov",
        PtxOp::Ld => "ld",
        PtxOp::St => "st",
        PtxOp::Cvt => "cvt",
        PtxOp::Selp => "selp",
        PtxOp::ShflDown => "shfl.sync.down",
        PtxOp::ShflIdx => "shfl.sync.idx",
        PtxOp::Bra => "bra",
        PtxOp::Call => "call",
        PtxOp::Ret => "ret",
        PtxOp::Exit => "exit",
        PtxOp::Trap => "trap",
        PtxOp::Bar => "bar.sync",
        PtxOp::MemBar => "membar.cta",
        PtxOp::AtomCas => "atom",
        PtxOp::Label | PtxOp::Marker(_) | PtxOp::Reduction(_) => "",
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reg(reg) => f.write_str(&reg.to_ptx_string()),
            Self::SpecialReg(reg) => f.write_str(reg.to_ptx_string()),
            Self::ImmI64(v) => write!(f, "{}", v),
            Self::ImmU64(v) => write!(f, "{}", v),
            Self::ImmF32(v) => write!(f, "0f{:08X}", v.to_bits()),
            Self::ImmF64(v) => write!(f, "0d{:016X}", v.to_bits()),
            Self::Symbol(name) | Self::Label(name) => f.write_str(name),
            Self::Addr { base, offset: 0 } => write!(f, "[{}]", base.to_ptx_string()),
            Self::Addr { base, offset } => write!(f, "[{}+{}]", base.to_ptx_string(), offset),
            Self::Block(block) => write!(f, "$L__{}", block),
        }
    }
}

impl fmt::Display for PtxInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            PtxOp::Label => return write!(f, "{}:", self.label.as_deref().unwrap_or("")),
            PtxOp::Marker(marker) => {
                let kind = match marker.kind {
                    MarkerKind::PreEnter => "pre-enter",
                    MarkerKind::Enter => "enter",
                    MarkerKind::PreLeave => "pre-leave",
                    MarkerKind::Leave => "leave",
                };
                return write!(f, "// {} {}", kind, marker.mask);
            }
            PtxOp::Reduction(call) => {
                return write!(
                    f,
                    "// reduction {:?} {:?} {} +{}",
                    call.phase, call.op, call.axis, call.offset
                );
            }
            _ => {}
        }

        if let Some(pred) = self.predicate {
            let bang = if pred.negated { "!" } else { "" };
            write!(f, "@{}{} ", bang, pred.reg.to_ptx_string())?;
        }
        f.write_str(mnemonic(&self.op))?;
        if self.op == PtxOp::Bra && self.uniform {
            f.write_str(".uni")?;
        }
        if self.op == PtxOp::AtomCas {
            if let Some(space) = self.state_space {
                write!(f, "{}", space)?;
            }
            f.write_str(".cas")?;
        } else if let Some(space) = self.state_space {
            write!(f, "{}", space)?;
        }
        if let Some(cmp) = self.cmp {
            write!(f, ".{}", cmp.to_ptx_string())?;
        }
        if !matches!(
            self.op,
            PtxOp::Bra | PtxOp::Ret | PtxOp::Exit | PtxOp::Trap | PtxOp::Bar | PtxOp::Call
        ) {
            write!(f, "{}", self.ty)?;
        }

        let mut operands: Vec<String> = Vec::new();
        match self.op {
            PtxOp::Unpack => {
                let halves: Vec<String> = self.dsts.iter().map(ToString::to_string).collect();
                operands.push(format!("{{{}}}", halves.join(", ")));
            }
            PtxOp::Pack => {
                if let Some(dst) = &self.dst {
                    operands.push(dst.to_string());
                }
                let halves: Vec<String> = self.srcs.iter().map(ToString::to_string).collect();
                operands.push(format!("{{{}}}", halves.join(", ")));
            }
            _ => {
                if let Some(dst) = &self.dst {
                    operands.push(dst.to_string());
                }
                operands.extend(self.dsts.iter().map(ToString::to_string));
            }
        }
        if self.op != PtxOp::Pack {
            operands.extend(self.srcs.iter().map(|src| match (&self.op, src) {
                (PtxOp::St | PtxOp::Ld | PtxOp::AtomCas, Operand::Symbol(name)) => {
                    format!("[{}]", name)
                }
                _ => src.to_string(),
            }));
        }
        if matches!(self.op, PtxOp::ShflDown | PtxOp::ShflIdx) {
            operands.push("0xffffffff".to_string());
        }
        if let (PtxOp::Call, Some(label)) = (&self.op, &self.label) {
            operands.insert(0, label.clone());
        }

        if !operands.is_empty() {
            write!(f, " {}", operands.join(", "))?;
        }
        f.write_str(";")
    }
}
