//! Section tables of loaded ELF and PE images

use goblin::elf::program_header::PT_LOAD;
use goblin::elf::section_header::{SHF_ALLOC, SHF_EXECINSTR, SHF_TLS};
use goblin::elf::Elf;
use goblin::pe::section_table::{IMAGE_SCN_CNT_CODE, IMAGE_SCN_MEM_READ};
use goblin::pe::PE;
use goblin::Object;

use super::{merge_adjacent, ImageError, Segment, SegmentProvider};

/// One section of a loaded image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Section name, e.g. `.text`
    pub name: String,
    /// Where the section lives in memory
    pub segment: Segment,
    /// Whether the section is mapped readable
    pub readable: bool,
    /// Whether the section contains code
    pub code: bool,
}

/// A loaded image: where it is mapped, and the sections inside it
#[derive(Debug, Clone)]
pub struct Module {
    /// Lowest mapped address of the image
    base: usize,
    /// Size of the image in memory
    size: usize,
    /// Sections in header order
    sections: Vec<Section>,
}

impl Module {
    /// Describes an image from an already known section list.
    ///
    /// # Safety
    ///
    /// `[base, base + size)` and every section must be mapped for as long as the module is used,
    /// and every section marked readable must be readable.
    pub unsafe fn from_sections(base: usize, size: usize, sections: Vec<Section>) -> Self {
        Self {
            base,
            size,
            sections,
        }
    }

    /// Describes an image loaded at `base` from the contents of its file.
    ///
    /// # Safety
    ///
    /// `image` must be the file that is loaded at `base`, and the image must stay loaded for as long as the module is used.
    pub unsafe fn parse(base: usize, image: &[u8]) -> Result<Self, ImageError> {
        match Object::parse(image)? {
            Object::Elf(elf) => Ok(Self::from_elf(base, &elf)),
            Object::PE(pe) => Ok(Self::from_pe(base, &pe)),
            _ => Err(ImageError::UnsupportedFormat),
        }
    }

    /// Builds the section list of an ELF image
    fn from_elf(base: usize, elf: &Elf) -> Self {
        let page_mask = !(region::page::size() as u64 - 1);
        let loads = elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD);
        let low = loads.clone().map(|ph| ph.p_vaddr).min().unwrap_or(0) & page_mask;
        let high = loads.map(|ph| ph.p_vaddr + ph.p_memsz).max().unwrap_or(0);

        // position independent images are linked at 0 and moved as a whole
        let bias = base.wrapping_sub(low as usize);

        let sections = elf
            .section_headers
            .iter()
            .filter(|sh| {
                sh.sh_flags & u64::from(SHF_ALLOC) != 0
                    && sh.sh_flags & u64::from(SHF_TLS) == 0
                    && sh.sh_size != 0
            })
            .map(|sh| {
                let start = bias.wrapping_add(sh.sh_addr as usize);
                Section {
                    name: elf
                        .shdr_strtab
                        .get_at(sh.sh_name)
                        .unwrap_or_default()
                        .to_owned(),
                    segment: Segment::new(start, start + sh.sh_size as usize),
                    readable: true,
                    code: sh.sh_flags & u64::from(SHF_EXECINSTR) != 0,
                }
            })
            .collect();

        Self {
            base,
            size: high.saturating_sub(low) as usize,
            sections,
        }
    }

    /// Builds the section list of a PE image
    fn from_pe(base: usize, pe: &PE) -> Self {
        let size = pe
            .header
            .optional_header
            .as_ref()
            .map_or(0, |header| header.windows_fields.size_of_image as usize);

        let sections = pe
            .sections
            .iter()
            .map(|section| {
                let start = base + section.virtual_address as usize;
                Section {
                    name: section.name().unwrap_or_default().to_owned(),
                    segment: Segment::new(start, start + section.virtual_size as usize),
                    readable: section.characteristics & IMAGE_SCN_MEM_READ != 0,
                    code: section.characteristics & IMAGE_SCN_CNT_CODE != 0,
                }
            })
            .collect();

        Self {
            base,
            size,
            sections,
        }
    }

    /// Lowest mapped address of the image
    pub fn base(&self) -> usize {
        self.base
    }

    /// Size of the image in memory
    pub fn size(&self) -> usize {
        self.size
    }

    /// The whole image as one segment
    pub fn image_segment(&self) -> Segment {
        Segment::new(self.base, self.base + self.size)
    }

    /// Sections in header order
    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    /// First section named exactly `name`
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }
}

impl SegmentProvider for Module {
    fn readable_segments(&self) -> Vec<Segment> {
        merge_adjacent(
            self.sections
                .iter()
                .filter(|s| s.readable)
                .map(|s| s.segment),
        )
    }

    fn code_segments(&self) -> Vec<Segment> {
        merge_adjacent(self.sections.iter().filter(|s| s.code).map(|s| s.segment))
    }

    fn section_segments(&self, name: &str) -> Vec<Segment> {
        self.sections
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.segment)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Module, Section};
    use crate::segment::{Segment, SegmentProvider};

    /// Section with the given flags
    fn section(name: &str, start: usize, end: usize, readable: bool, code: bool) -> Section {
        Section {
            name: name.to_owned(),
            segment: Segment::new(start, end),
            readable,
            code,
        }
    }

    /// A made up module; never dereferenced
    fn module() -> Module {
        unsafe {
            Module::from_sections(
                0x1000,
                0x6000,
                vec![
                    section(".text", 0x1000, 0x3000, true, true),
                    section(".init", 0x3000, 0x3100, true, true),
                    section(".rdata", 0x4000, 0x5000, true, false),
                    section(".discard", 0x5000, 0x5100, false, false),
                    section(".data", 0x6000, 0x7000, true, false),
                ],
            )
        }
    }

    #[test]
    fn test_readable_segments() {
        assert_eq!(
            module().readable_segments(),
            [
                Segment::new(0x1000, 0x3100),
                Segment::new(0x4000, 0x5000),
                Segment::new(0x6000, 0x7000),
            ]
        );
    }

    #[test]
    fn test_code_segments() {
        assert_eq!(module().code_segments(), [Segment::new(0x1000, 0x3100)]);
    }

    #[test]
    fn test_section_segments() {
        let module = module();
        assert_eq!(module.section_segments(".rdata"), [Segment::new(0x4000, 0x5000)]);
        assert!(module.section_segments(".rdat").is_empty());
        assert_eq!(module.image_segment(), Segment::new(0x1000, 0x7000));
        assert!(module.section(".data").is_some());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(unsafe { Module::parse(0x1000, &[0u8; 64]) }.is_err());
    }
}
