//! Module lookup through `dl_iterate_phdr`
//!
//! An image's range is the union of its `PT_LOAD` segments; its build id is
//! read from the `PT_NOTE` segments already mapped in memory, so nothing is
//! read from disk here.

#![allow(unsafe_code)] // dl_iterate_phdr and in-memory program headers
#![allow(clippy::cast_possible_truncation)] // ELF64 fields on 64-bit targets

use super::loader::ModuleLoader;
use super::unique_id::{elf_unique_id, find_gnu_build_id};
use crate::domain::AddressRange;
use stacksnap_common::Module;
use std::ffi::CStr;

/// Resolves addresses against the images the dynamic loader knows about
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxModuleLoader;

impl LinuxModuleLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for LinuxModuleLoader {
    fn module_for_address(&self, address: usize) -> Option<Module> {
        let mut search = Search { address, found: None };
        unsafe {
            libc::dl_iterate_phdr(Some(visit_object), std::ptr::addr_of_mut!(search).cast());
        }
        search.found
    }
}

struct Search {
    address: usize,
    found: Option<Module>,
}

unsafe extern "C" fn visit_object(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let search = unsafe { &mut *data.cast::<Search>() };
    let info = unsafe { &*info };
    if info.dlpi_phdr.is_null() {
        return 0;
    }
    let headers = unsafe { std::slice::from_raw_parts(info.dlpi_phdr, usize::from(info.dlpi_phnum)) };
    let bias = info.dlpi_addr as usize;

    let mut image: Option<AddressRange> = None;
    let mut owns_address = false;
    for header in headers.iter().filter(|h| h.p_type == libc::PT_LOAD) {
        let start = bias.wrapping_add(header.p_vaddr as usize);
        let segment = AddressRange::new(start, start.wrapping_add(header.p_memsz as usize));
        owns_address |= segment.contains(search.address);
        image = Some(match image {
            Some(range) => AddressRange::new(range.start.min(segment.start), range.end.max(segment.end)),
            None => segment,
        });
    }

    let Some(image) = image.filter(|_| owns_address) else {
        return 0;
    };

    let unique_id = headers
        .iter()
        .filter(|h| h.p_type == libc::PT_NOTE)
        .find_map(|h| {
            let notes = unsafe {
                std::slice::from_raw_parts(
                    bias.wrapping_add(h.p_vaddr as usize) as *const u8,
                    h.p_memsz as usize,
                )
            };
            find_gnu_build_id(notes, h.p_align).map(elf_unique_id)
        })
        .unwrap_or_default();

    search.found = Some(Module {
        base_address: image.start,
        size: image.len(),
        unique_id,
        file_path: object_path(info),
        load_bias: bias,
    });
    1
}

/// Path of a loaded object; the main executable reports an empty name
fn object_path(info: &libc::dl_phdr_info) -> String {
    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        unsafe { CStr::from_ptr(info.dlpi_name) }.to_string_lossy().into_owned()
    };
    if !name.is_empty() {
        return name;
    }
    std::env::current_exe()
        .map(|path| path.to_string_lossy().into_owned())
        .unwrap_or_default()
}
