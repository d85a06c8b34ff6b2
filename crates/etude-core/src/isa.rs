//! ISA feature bitmask
//!
//! A flag is present only when both the CPU reports the feature and the
//! operating system saves the relevant register state on context switch.
//! On x86 the standard library's feature macros already intersect CPUID
//! with XCR0, so the runtime never has to read control registers itself.

use flagset::{flags, FlagSet};

flags! {
    /// A single vector-ISA extension.
    pub enum IsaFlag: u32 {
        Sse = 0x0001,
        Sse2 = 0x0002,
        Sse3 = 0x0004,
        Ssse3 = 0x0008,
        Sse41 = 0x0010,
        Sse42 = 0x0020,
        Avx = 0x0040,
        Avx2 = 0x0080,
        Avx512f = 0x0100,
        Avx512dq = 0x0200,
        Avx512bw = 0x0400,
        Avx512vl = 0x0800,
        Neon = 0x1000,
        Fma = 0x2000,
    }
}

/// The set of extensions usable in this process. Empty means scalar only.
pub type IsaSet = FlagSet<IsaFlag>;

/// True when every flag in `required` is present in `available`.
pub fn isa_supports(available: IsaSet, required: IsaSet) -> bool {
    (required & !available).is_empty()
}

/// Human-readable rendering for logs and the bench CLI, e.g. "sse2|avx|avx2".
pub fn isa_names(set: IsaSet) -> String {
    let mut names = Vec::new();
    for (flag, name) in [
        (IsaFlag::Sse, "sse"),
        (IsaFlag::Sse2, "sse2"),
        (IsaFlag::Sse3, "sse3"),
        (IsaFlag::Ssse3, "ssse3"),
        (IsaFlag::Sse41, "sse4.1"),
        (IsaFlag::Sse42, "sse4.2"),
        (IsaFlag::Avx, "avx"),
        (IsaFlag::Avx2, "avx2"),
        (IsaFlag::Avx512f, "avx512f"),
        (IsaFlag::Avx512dq, "avx512dq"),
        (IsaFlag::Avx512bw, "avx512bw"),
        (IsaFlag::Avx512vl, "avx512vl"),
        (IsaFlag::Neon, "neon"),
        (IsaFlag::Fma, "fma"),
    ] {
        if set.contains(flag) {
            names.push(name);
        }
    }
    if names.is_empty() {
        "none".to_string()
    } else {
        names.join("|")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_check() {
        let available = IsaFlag::Sse | IsaFlag::Sse2 | IsaFlag::Avx;
        assert!(isa_supports(available, IsaFlag::Sse.into()));
        assert!(isa_supports(available, IsaFlag::Sse | IsaFlag::Avx));
        assert!(!isa_supports(available, IsaFlag::Avx2.into()));
        assert!(!isa_supports(available, IsaFlag::Avx | IsaFlag::Neon));
    }

    #[test]
    fn test_empty_required_always_supported() {
        assert!(isa_supports(IsaSet::default(), IsaSet::default()));
        assert!(isa_supports(IsaFlag::Neon.into(), IsaSet::default()));
    }

    #[test]
    fn test_names() {
        assert_eq!(isa_names(IsaSet::default()), "none");
        assert_eq!(isa_names(IsaFlag::Sse2 | IsaFlag::Avx2), "sse2|avx2");
    }
}
