//! Module lookup through `dladdr` and the in-memory Mach-O header
//!
//! The `__TEXT` segment defines the module range (code addresses always fall
//! inside it); `LC_UUID` supplies the build id.

#![allow(unsafe_code)] // dladdr and in-memory image headers

use super::loader::ModuleLoader;
use super::unique_id::macho_unique_id;
use object::macho::MachHeader64;
use object::read::macho::MachHeader;
use object::Endianness;
use stacksnap_common::Module;
use std::ffi::CStr;

#[derive(Debug, Default, Clone, Copy)]
pub struct MacModuleLoader;

impl MacModuleLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for MacModuleLoader {
    fn module_for_address(&self, address: usize) -> Option<Module> {
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        if unsafe { libc::dladdr(address as *const libc::c_void, &mut info) } == 0
            || info.dli_fbase.is_null()
        {
            return None;
        }

        let base_address = info.dli_fbase as usize;
        let image = unsafe { parse_image(base_address) }.unwrap_or_default();
        let size = image.text_size;
        let module = Module {
            base_address,
            size,
            unique_id: image.uuid.as_ref().map(macho_unique_id).unwrap_or_default(),
            file_path: if info.dli_fname.is_null() {
                String::new()
            } else {
                unsafe { CStr::from_ptr(info.dli_fname) }.to_string_lossy().into_owned()
            },
            load_bias: base_address.wrapping_sub(image.text_vmaddr),
        };

        module.contains(address).then_some(module)
    }
}

#[derive(Default)]
struct ImageInfo {
    text_vmaddr: usize,
    text_size: usize,
    uuid: Option<[u8; 16]>,
}

/// Read `__TEXT` and `LC_UUID` from the header mapped at `base`
///
/// # Safety
///
/// `base` must be the load address of a mapped Mach-O image.
#[allow(clippy::cast_possible_truncation)]
unsafe fn parse_image(base: usize) -> Option<ImageInfo> {
    let header_size = std::mem::size_of::<MachHeader64<Endianness>>();
    let header_bytes = unsafe { std::slice::from_raw_parts(base as *const u8, header_size) };
    let header = MachHeader64::<Endianness>::parse(header_bytes, 0).ok()?;
    let endian = header.endian().ok()?;

    let total = header_size + header.sizeofcmds(endian) as usize;
    let data = unsafe { std::slice::from_raw_parts(base as *const u8, total) };
    let mut commands = header.load_commands(endian, data, 0).ok()?;

    let mut info = ImageInfo::default();
    while let Ok(Some(command)) = commands.next() {
        if let Ok(Some((segment, _))) = command.segment_64() {
            let name = segment.segname.split(|&b| b == 0).next().unwrap_or_default();
            if name == b"__TEXT" {
                info.text_vmaddr = segment.vmaddr.get(endian) as usize;
                info.text_size = segment.vmsize.get(endian) as usize;
            }
        } else if let Ok(Some(uuid)) = command.uuid() {
            info.uuid = Some(uuid.uuid);
        }
    }
    Some(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn code_address() -> usize {
        std::hint::black_box(7)
    }

    #[test]
    fn test_resolves_own_code() {
        let address = code_address as *const () as usize;
        let module = MacModuleLoader::new().module_for_address(address).unwrap();

        assert!(module.contains(address));
        assert_eq!(module.unique_id.len(), 33);
    }
}
