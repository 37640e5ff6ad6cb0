//! Preset selector matching.
//!
//! Textual selector fields are wildcard patterns (`%` matches any run of
//! characters, as in the preset store's query language), compared without
//! case. Numeric fields are inclusive ranges. An empty pattern or a zero
//! format mask means "any".

use regex::RegexBuilder;

use core_image::CaptureMeta;

use crate::Preset;

/// Number of literal (non-wildcard) characters in a pattern; the resolver's
/// specificity measure.
pub fn literal_len(pattern: &str) -> usize {
    pattern.chars().filter(|c| *c != '%').count()
}

/// Wildcard match, case-insensitive, whole-string.
pub fn pattern_matches(pattern: &str, value: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        if c == '%' {
            re.push_str(".*");
        } else {
            re.push_str(&regex::escape(&c.to_string()));
        }
    }
    re.push('$');
    match RegexBuilder::new(&re).case_insensitive(true).build() {
        Ok(rx) => rx.is_match(value),
        // An unbuildable pattern cannot match anything.
        Err(_) => false,
    }
}

fn in_range(value: f32, min: f32, max: f32) -> bool {
    value >= min && value <= max
}

/// Full selector check of `preset` against capture metadata. The model
/// pattern accepts either the raw model string or the normalized camera
/// alias.
pub fn selector_matches(preset: &Preset, meta: &CaptureMeta) -> bool {
    let model_ok = pattern_matches(&preset.model, &meta.model)
        || pattern_matches(&preset.model, &meta.camera_alias);
    model_ok
        && pattern_matches(&preset.maker, &meta.maker)
        && pattern_matches(&preset.lens, &meta.lens)
        && in_range(meta.iso, preset.iso_min, preset.iso_max)
        && in_range(meta.exposure, preset.exposure_min, preset.exposure_max)
        && in_range(meta.aperture, preset.aperture_min, preset.aperture_max)
        && in_range(meta.focal_length, preset.focal_length_min, preset.focal_length_max)
        && (preset.format == 0 || preset.format & meta.format_mask() != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_image::format_mask;

    fn meta() -> CaptureMeta {
        CaptureMeta {
            maker: "NIKON CORPORATION".into(),
            model: "NIKON Z 6".into(),
            camera_alias: "Z6".into(),
            lens: "NIKKOR Z 50mm f/1.8 S".into(),
            iso: 1600.0,
            exposure: 1.0 / 125.0,
            aperture: 1.8,
            focal_length: 50.0,
            is_raw: true,
            is_hdr: false,
            is_ldr: false,
            is_monochrome: false,
            change_timestamp: 0,
        }
    }

    #[test]
    fn wildcard_and_case_folding() {
        assert!(pattern_matches("nikon%", "NIKON Z 6"));
        assert!(pattern_matches("%z 6", "NIKON Z 6"));
        assert!(pattern_matches("", "anything"));
        assert!(!pattern_matches("canon%", "NIKON Z 6"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(pattern_matches("f/1.8", "f/1.8"));
        assert!(!pattern_matches("f/1.8", "f/128"), "dot must not be a wildcard");
    }

    #[test]
    fn model_pattern_accepts_alias() {
        let mut p = Preset::auto("p", "exposure", 2, vec![]);
        p.model = "Z6".into();
        assert!(selector_matches(&p, &meta()));
    }

    #[test]
    fn iso_range_is_inclusive() {
        let mut p = Preset::auto("p", "exposure", 2, vec![]);
        p.iso_min = 1600.0;
        p.iso_max = 1600.0;
        assert!(selector_matches(&p, &meta()));
        p.iso_max = 1599.0;
        assert!(!selector_matches(&p, &meta()));
    }

    #[test]
    fn format_mask_zero_matches_any() {
        let mut p = Preset::auto("p", "exposure", 2, vec![]);
        assert!(selector_matches(&p, &meta()));
        p.format = format_mask::LDR;
        assert!(!selector_matches(&p, &meta()), "raw capture, LDR-only preset");
        p.format = format_mask::RAW | format_mask::LDR;
        assert!(selector_matches(&p, &meta()));
    }

    #[test]
    fn literal_len_ignores_wildcards() {
        assert_eq!(literal_len("%"), 0);
        assert_eq!(literal_len("X-T4"), 4);
        assert_eq!(literal_len("%T4%"), 2);
    }
}
