//! CFI unwinding from `.eh_frame`
//!
//! Each module's `.eh_frame` is read from its file on disk the first time a
//! frame lands in it, indexed by FDE address range, and kept until
//! [`Unwinder::reset`]. Lookups use link-time addresses (`pc - load_bias`).
//!
//! Only the rule kinds compilers emit for ordinary code are evaluated:
//!
//! | Rule                 | Caller value                |
//! |----------------------|-----------------------------|
//! | CFA `reg + offset`   | `reg + offset`              |
//! | `undefined`/`same`   | unchanged                   |
//! | `offset(n)`          | word at `CFA + n`           |
//! | `val_offset(n)`      | `CFA + n`                   |
//! | `register(r)`        | value of `r`                |
//!
//! Anything else (DWARF expressions, architectural rules) aborts the step.
//! A pc no FDE covers (hand-written assembly, stripped images, the vDSO) is
//! stepped with the frame-record unwinder instead.

use super::{FramePointerUnwinder, UnwindResult, Unwinder};
use crate::capture::{CapturedStack, RegisterContext};
use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, EhFrameOffset, EndianSlice, RegisterRule,
    RunTimeEndian, UnwindContext, UnwindSection, UnwindTableRow,
};
use log::debug;
use object::{Object, ObjectSection};
use stacksnap_common::Module;
use std::collections::HashMap;

/// Address range covered by one FDE, link-time addresses
#[derive(Debug, Clone, Copy)]
struct FdeRange {
    start: u64,
    end: u64,
    offset: usize,
}

/// Parsed `.eh_frame` of one module
struct UnwindTable {
    eh_frame: Vec<u8>,
    endian: RunTimeEndian,
    bases: BaseAddresses,
    /// Sorted by `start`
    fdes: Vec<FdeRange>,
}

impl UnwindTable {
    fn load(module: &Module) -> Option<Self> {
        let data = match std::fs::read(&module.file_path) {
            Ok(data) => data,
            Err(err) => {
                debug!("No unwind tables for {}: {err}", module.file_path);
                return None;
            }
        };
        let file = match object::File::parse(&*data) {
            Ok(file) => file,
            Err(err) => {
                debug!("Cannot parse {}: {err}", module.file_path);
                return None;
            }
        };

        let section = file.section_by_name(".eh_frame")?;
        let eh_frame = section.uncompressed_data().ok()?.into_owned();
        let endian = if file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let mut bases = BaseAddresses::default().set_eh_frame(section.address());
        if let Some(text) = file.section_by_name(".text") {
            bases = bases.set_text(text.address());
        }
        if let Some(got) = file.section_by_name(".got") {
            bases = bases.set_got(got.address());
        }

        let mut table = Self { eh_frame, endian, bases, fdes: Vec::new() };
        table.fdes = table.index_fdes();
        debug!("Indexed {} FDEs from {}", table.fdes.len(), module.file_path);
        Some(table)
    }

    fn section(&self) -> EhFrame<EndianSlice<'_, RunTimeEndian>> {
        let mut section = EhFrame::new(&self.eh_frame, self.endian);
        section.set_address_size(8);
        section
    }

    fn index_fdes(&self) -> Vec<FdeRange> {
        let section = self.section();
        let mut entries = section.entries(&self.bases);
        let mut fdes = Vec::new();
        // A malformed entry ends the scan; what was indexed so far stays usable.
        while let Ok(Some(entry)) = entries.next() {
            let CieOrFde::Fde(partial) = entry else {
                continue;
            };
            let Ok(fde) = partial.parse(EhFrame::cie_from_offset) else {
                continue;
            };
            if fde.len() == 0 {
                continue;
            }
            fdes.push(FdeRange {
                start: fde.initial_address(),
                end: fde.initial_address().saturating_add(fde.len()),
                offset: fde.offset(),
            });
        }
        fdes.sort_by_key(|fde| fde.start);
        fdes
    }

    fn fde_for(&self, svma: u64) -> Option<&FdeRange> {
        let index = self.fdes.partition_point(|fde| fde.start <= svma);
        let fde = self.fdes.get(index.checked_sub(1)?)?;
        (svma < fde.end).then_some(fde)
    }

    /// Step `context` with the row covering `svma`; `None` if no FDE covers it
    fn step(
        &self,
        unwind_context: &mut UnwindContext<usize>,
        svma: u64,
        context: &mut RegisterContext,
        stack: &CapturedStack<'_>,
        is_first_frame: bool,
    ) -> Option<UnwindResult> {
        let offset = self.fde_for(svma)?.offset;
        let section = self.section();
        let Ok(fde) = section.fde_from_offset(&self.bases, EhFrameOffset(offset), EhFrame::cie_from_offset)
        else {
            return Some(UnwindResult::Aborted);
        };
        let Ok(row) = fde.unwind_info_for_address(&section, &self.bases, unwind_context, svma) else {
            return Some(UnwindResult::Aborted);
        };
        Some(apply_row(row, context, stack, is_first_frame))
    }
}

/// Evaluate a CFI row against the current frame's registers
fn apply_row(
    row: &UnwindTableRow<usize>,
    context: &mut RegisterContext,
    stack: &CapturedStack<'_>,
    is_first_frame: bool,
) -> UnwindResult {
    let CfaRule::RegisterAndOffset { register, offset } = row.cfa() else {
        return UnwindResult::Aborted;
    };
    let Some(cfa) = context
        .get(*register)
        .and_then(|base| base.checked_add_signed(isize::try_from(*offset).ok()?))
    else {
        return UnwindResult::Aborted;
    };

    let sp = context.stack_pointer();
    let cfa_moved_up = cfa > sp || (is_first_frame && cfa == sp);
    if !cfa_moved_up || cfa > stack.top() {
        return UnwindResult::Aborted;
    }

    let mut caller = context.clone();
    for &register in RegisterContext::CALLEE_SAVED {
        match recover(row.register(register), cfa, context, stack) {
            Recovered::Value(value) => {
                caller.set(register, value);
            }
            Recovered::Unchanged => {}
            Recovered::Failed => return UnwindResult::Aborted,
        }
    }

    let return_address = match recover(row.register(RegisterContext::RETURN_ADDRESS), cfa, context, stack) {
        Recovered::Value(value) => value,
        Recovered::Unchanged => match row.register(RegisterContext::RETURN_ADDRESS) {
            RegisterRule::Undefined if !link_register_holds_return(is_first_frame) => {
                return UnwindResult::Completed;
            }
            _ => context.get(RegisterContext::RETURN_ADDRESS).unwrap_or(0),
        },
        Recovered::Failed => return UnwindResult::Aborted,
    };
    if return_address == 0 {
        return UnwindResult::Completed;
    }

    caller.set(RegisterContext::RETURN_ADDRESS, return_address);
    caller.set_instruction_pointer(return_address);
    caller.set_stack_pointer(cfa);
    *context = caller;
    UnwindResult::Unfinished
}

/// On aarch64 a leaf may never spill `lr`, leaving its return-address rule undefined
fn link_register_holds_return(is_first_frame: bool) -> bool {
    cfg!(target_arch = "aarch64") && is_first_frame
}

enum Recovered {
    Value(usize),
    Unchanged,
    Failed,
}

fn recover(
    rule: RegisterRule<usize>,
    cfa: usize,
    context: &RegisterContext,
    stack: &CapturedStack<'_>,
) -> Recovered {
    let at_cfa = |offset: i64| cfa.checked_add_signed(isize::try_from(offset).ok()?);
    let value = match rule {
        // gimli reports omitted columns as undefined; treat both as preserved.
        RegisterRule::Undefined | RegisterRule::SameValue => return Recovered::Unchanged,
        RegisterRule::Offset(offset) => at_cfa(offset).and_then(|address| stack.read_word(address)),
        RegisterRule::ValOffset(offset) => at_cfa(offset),
        RegisterRule::Register(register) => context.get(register),
        _ => None,
    };
    value.map_or(Recovered::Failed, Recovered::Value)
}

/// Unwinds with `.eh_frame` CFI, falling back to frame records
pub struct DwarfUnwinder {
    tables: HashMap<usize, Option<UnwindTable>>,
    unwind_context: Box<UnwindContext<usize>>,
}

impl DwarfUnwinder {
    #[must_use]
    pub fn new() -> Self {
        Self { tables: HashMap::new(), unwind_context: Box::new(UnwindContext::new()) }
    }

    fn table_for(&mut self, module: &Module) -> Option<&UnwindTable> {
        self.tables
            .entry(module.base_address)
            .or_insert_with(|| UnwindTable::load(module))
            .as_ref()
    }
}

impl Default for DwarfUnwinder {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup_svma(pc: usize, module: &Module, is_first_frame: bool) -> u64 {
    // Return addresses point past the call; look up the call itself.
    let pc = if is_first_frame { pc } else { pc.wrapping_sub(1) };
    pc.wrapping_sub(module.load_bias) as u64
}

impl Unwinder for DwarfUnwinder {
    fn has_unwind_info(&mut self, pc: usize, module: &Module) -> bool {
        let svma = lookup_svma(pc, module, true);
        self.table_for(module).is_some_and(|table| table.fde_for(svma).is_some())
    }

    fn step(
        &mut self,
        context: &mut RegisterContext,
        stack: &CapturedStack<'_>,
        module: &Module,
        is_first_frame: bool,
    ) -> UnwindResult {
        let svma = lookup_svma(context.instruction_pointer(), module, is_first_frame);
        self.tables
            .entry(module.base_address)
            .or_insert_with(|| UnwindTable::load(module));
        let outcome = match self.tables.get(&module.base_address) {
            Some(Some(table)) => {
                table.step(&mut self.unwind_context, svma, context, stack, is_first_frame)
            }
            _ => None,
        };
        outcome.unwrap_or_else(|| FramePointerUnwinder::step_frame(context, stack))
    }

    fn reset(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::StackBuffer;
    use crate::modules::{ModuleLoader, NativeModuleLoader};

    #[inline(never)]
    fn code_address() -> usize {
        std::hint::black_box(code_address as *const () as usize)
    }

    #[test]
    fn test_own_code_has_cfi() {
        let pc = code_address();
        let module = NativeModuleLoader::new().module_for_address(pc).expect("test binary is loaded");

        let mut unwinder = DwarfUnwinder::new();
        assert!(unwinder.has_unwind_info(pc, &module));
        assert!(unwinder.has_unwind_info(pc, &module), "served from cache");
        assert_eq!(unwinder.tables.len(), 1);

        unwinder.reset();
        assert!(unwinder.tables.is_empty());
    }

    #[test]
    fn test_missing_file_falls_back_to_frame_records() {
        let module = Module {
            base_address: 0x40_0000,
            size: 0x1000,
            unique_id: String::new(),
            file_path: "/nonexistent/stacksnap-test-image".to_string(),
            load_bias: 0x40_0000,
        };
        let buffer = StackBuffer::new(256);
        let stack = CapturedStack::new(buffer.words(), buffer.base_address());
        let mut context = RegisterContext::new();
        context.set_instruction_pointer(0x40_0100);
        context.set_stack_pointer(buffer.base_address());

        let mut unwinder = DwarfUnwinder::new();
        assert!(!unwinder.has_unwind_info(0x40_0100, &module));
        // fp == 0: the frame-record walk ends here
        assert_eq!(unwinder.step(&mut context, &stack, &module, true), UnwindResult::Completed);
    }

    #[test]
    fn test_fde_lookup_boundaries() {
        let table = UnwindTable {
            eh_frame: Vec::new(),
            endian: RunTimeEndian::Little,
            bases: BaseAddresses::default(),
            fdes: vec![
                FdeRange { start: 0x1000, end: 0x1100, offset: 0 },
                FdeRange { start: 0x1200, end: 0x1280, offset: 40 },
            ],
        };

        assert!(table.fde_for(0x0fff).is_none());
        assert_eq!(table.fde_for(0x1000).map(|f| f.offset), Some(0));
        assert_eq!(table.fde_for(0x10ff).map(|f| f.offset), Some(0));
        assert!(table.fde_for(0x1100).is_none());
        assert_eq!(table.fde_for(0x1250).map(|f| f.offset), Some(40));
        assert!(table.fde_for(0x1280).is_none());
    }
}
