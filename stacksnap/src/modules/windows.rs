//! Module lookup through the Win32 loader and the in-memory PE header
//!
//! The build id is the CodeView `RSDS` record referenced by the image's
//! debug directory.

#![allow(unsafe_code)] // Win32 module APIs and in-memory image headers

use super::loader::ModuleLoader;
use super::unique_id::{parse_codeview_rsds, pe_unique_id};
use object::pe::{
    ImageDebugDirectory, ImageDosHeader, ImageNtHeaders64, IMAGE_DEBUG_TYPE_CODEVIEW,
    IMAGE_DIRECTORY_ENTRY_DEBUG,
};
use object::read::pe::ImageNtHeaders;
use object::LittleEndian as LE;
use stacksnap_common::Module;
use windows_sys::Win32::Foundation::HMODULE;
use windows_sys::Win32::System::LibraryLoader::{
    GetModuleFileNameW, GetModuleHandleExW, GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS,
    GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT,
};
use windows_sys::Win32::System::ProcessStatus::{GetModuleInformation, MODULEINFO};
use windows_sys::Win32::System::Threading::GetCurrentProcess;

const MAX_PATH_CHARS: usize = 32_768;

#[derive(Debug, Default, Clone, Copy)]
pub struct WindowsModuleLoader;

impl WindowsModuleLoader {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ModuleLoader for WindowsModuleLoader {
    fn module_for_address(&self, address: usize) -> Option<Module> {
        let mut handle: HMODULE = 0;
        let flags =
            GET_MODULE_HANDLE_EX_FLAG_FROM_ADDRESS | GET_MODULE_HANDLE_EX_FLAG_UNCHANGED_REFCOUNT;
        if unsafe { GetModuleHandleExW(flags, address as *const u16, &mut handle) } == 0 {
            return None;
        }

        let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
        let info_size = u32::try_from(std::mem::size_of::<MODULEINFO>()).ok()?;
        if unsafe { GetModuleInformation(GetCurrentProcess(), handle, &mut info, info_size) } == 0 {
            return None;
        }

        let base_address = info.lpBaseOfDll as usize;
        let size = info.SizeOfImage as usize;
        let image = unsafe { std::slice::from_raw_parts(base_address as *const u8, size) };

        Some(Module {
            base_address,
            size,
            unique_id: codeview_unique_id(image).unwrap_or_default(),
            file_path: module_path(handle),
            // Images are mapped at their preferred base or relocated as a whole.
            load_bias: 0,
        })
    }
}

fn module_path(handle: HMODULE) -> String {
    let mut buffer = vec![0u16; MAX_PATH_CHARS];
    let len = unsafe {
        GetModuleFileNameW(handle, buffer.as_mut_ptr(), u32::try_from(buffer.len()).unwrap_or(0))
    } as usize;
    String::from_utf16_lossy(&buffer[..len.min(buffer.len())])
}

/// Unique id from the debug directory of a mapped image
fn codeview_unique_id(image: &[u8]) -> Option<String> {
    let dos = ImageDosHeader::parse(image).ok()?;
    let mut offset = dos.nt_headers_offset().into();
    let (_, directories) = ImageNtHeaders64::parse(image, &mut offset).ok()?;
    let directory = directories.get(IMAGE_DIRECTORY_ENTRY_DEBUG)?;

    let start = directory.virtual_address.get(LE) as usize;
    let len = directory.size.get(LE) as usize;
    let bytes = image.get(start..start.checked_add(len)?)?;
    let count = len / std::mem::size_of::<ImageDebugDirectory>();
    let (entries, _) = object::pod::slice_from_bytes::<ImageDebugDirectory>(bytes, count).ok()?;

    entries
        .iter()
        .filter(|entry| entry.typ.get(LE) == IMAGE_DEBUG_TYPE_CODEVIEW)
        .find_map(|entry| {
            let start = entry.address_of_raw_data.get(LE) as usize;
            let len = entry.size_of_data.get(LE) as usize;
            let record = image.get(start..start.checked_add(len)?)?;
            parse_codeview_rsds(record).map(|(guid, age)| pe_unique_id(&guid, age))
        })
}
