//! Locating the main executable of the running process

use std::fs;
use std::path::Path;

use lazy_static::lazy_static;
use log::debug;

use super::{ImageError, Module, Segment, SegmentProvider};

lazy_static! {
    static ref MAIN_IMAGE: Result<Module, ImageError> = locate_main_image();
    static ref DEFAULT_SEGMENTS: Vec<Segment> = MAIN_IMAGE
        .as_ref()
        .map(|module| module.readable_segments())
        .unwrap_or_default();
}

/// The main executable, located once per process.
///
/// Its readable sections are the default segments for scans.
pub fn main_image() -> Result<&'static Module, ImageError> {
    match &*MAIN_IMAGE {
        Ok(module) => Ok(module),
        Err(e) => Err(ImageError::MainImage(e.to_string())),
    }
}

/// Readable sections of the main executable, computed once per process.
///
/// These are the segments scans use when none are given.
pub fn default_segments() -> Result<&'static [Segment], ImageError> {
    main_image()?;
    Ok(&DEFAULT_SEGMENTS)
}

/// Parses the executable's file and pairs it with the address it is loaded at
fn locate_main_image() -> Result<Module, ImageError> {
    let path = std::env::current_exe()?;
    let base = image_base(&path)?;
    let image = fs::read(&path)?;

    // SAFETY: `image` is the file loaded at `base`, and the main executable is never unloaded
    let module = unsafe { Module::parse(base, &image)? };
    debug!(
        "main image {} at {:#x}, {} sections",
        path.display(),
        base,
        module.sections().len()
    );
    Ok(module)
}

/// Load address of the main executable: its first file-backed mapping at offset 0
#[cfg(target_os = "linux")]
fn image_base(path: &Path) -> Result<usize, ImageError> {
    let maps = fs::read_to_string("/proc/self/maps")?;
    maps.lines()
        .find_map(|line| parse_maps_line(line, path))
        .ok_or_else(|| ImageError::NotMapped(path.display().to_string()))
}

/// Load address of the main executable: its module handle
#[cfg(windows)]
fn image_base(_path: &Path) -> Result<usize, ImageError> {
    // SAFETY: a null name asks for the executable of the calling process
    let handle = unsafe { winapi::um::libloaderapi::GetModuleHandleW(std::ptr::null()) };
    Ok(handle as usize)
}

/// Load address of the main executable
#[cfg(not(any(target_os = "linux", windows)))]
fn image_base(_path: &Path) -> Result<usize, ImageError> {
    Err(ImageError::UnsupportedPlatform)
}

/// Returns the start of a `/proc/self/maps` line if it maps offset 0 of `path`.
///
/// Line format: `start-end perms offset dev inode pathname`
#[cfg(any(target_os = "linux", test))]
fn parse_maps_line(line: &str, path: &Path) -> Option<usize> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let _perms = fields.next()?;
    let offset = fields.next()?;

    // the path is the rest of the line and may contain spaces
    let pathname = &line[line.find('/')?..];
    if Path::new(pathname) != path || u64::from_str_radix(offset, 16).ok()? != 0 {
        return None;
    }

    let start = range.split('-').next()?;
    usize::from_str_radix(start, 16).ok()
}
