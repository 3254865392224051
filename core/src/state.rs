//! Image-state classifier (spec component H).

use std::fmt;

/// Lifecycle state of a disk image, derived from its GPT layout and the
/// presence of a signature envelope on the ESP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Base,
    Prepared,
    Protected,
    Unknown,
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImageState::Base => "base",
            ImageState::Prepared => "prepared",
            ImageState::Protected => "protected",
            ImageState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Facts about an opened image needed to classify it, gathered by the
/// caller (GPT engine + ESP file probe) so this module stays a pure
/// function and is trivially unit-testable.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyInput {
    /// The GPT entry array is sorted by `starting_lba` with no null gap
    /// followed by a non-null entry.
    pub gpt_sorted: bool,
    pub has_verity_partition: bool,
    pub has_linux_partition: bool,
    pub has_cvmboot_home_dir: bool,
    pub has_cpio_signature: bool,
}

/// Classifies an image per §4.8:
/// 1. unsorted GPT -> base
/// 2. verity partition present, or ESP has `EFI/cvmboot` -> prepared/protected
/// 3. else a Linux-data partition present -> base
/// 4. else -> unknown
pub fn classify(input: ClassifyInput) -> ImageState {
    if !input.gpt_sorted {
        return ImageState::Base;
    }

    if input.has_verity_partition || input.has_cvmboot_home_dir {
        return if input.has_cpio_signature {
            ImageState::Protected
        } else {
            ImageState::Prepared
        };
    }

    if input.has_linux_partition {
        return ImageState::Base;
    }

    ImageState::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_input() -> ClassifyInput {
        ClassifyInput {
            gpt_sorted: true,
            has_verity_partition: false,
            has_linux_partition: true,
            has_cvmboot_home_dir: false,
            has_cpio_signature: false,
        }
    }

    #[test]
    fn unsorted_gpt_is_always_base() {
        let mut input = base_input();
        input.gpt_sorted = false;
        input.has_verity_partition = true;
        input.has_cpio_signature = true;
        assert_eq!(classify(input), ImageState::Base);
    }

    #[test]
    fn verity_without_signature_is_prepared() {
        let mut input = base_input();
        input.has_verity_partition = true;
        assert_eq!(classify(input), ImageState::Prepared);
    }

    #[test]
    fn verity_with_signature_is_protected() {
        let mut input = base_input();
        input.has_verity_partition = true;
        input.has_cpio_signature = true;
        assert_eq!(classify(input), ImageState::Protected);
    }

    #[test]
    fn linux_partition_only_is_base() {
        assert_eq!(classify(base_input()), ImageState::Base);
    }

    #[test]
    fn nothing_recognizable_is_unknown() {
        let mut input = base_input();
        input.has_linux_partition = false;
        assert_eq!(classify(input), ImageState::Unknown);
    }
}
