//! Date and age arithmetic for the `@hashdate` and `@round` operators.

use chrono::{Duration, NaiveDate};

/// Days in ten years; the per-patient shift is always below this.
const DELTA_MODULUS: u64 = 3652;

/// Deterministic per-patient date shift: the MD5 digest of the PHI patient
/// id read as a big-endian integer, modulo 3652.
pub fn date_delta_for(phi_patient_id: &str) -> i64 {
    let digest = md5::compute(phi_patient_id.as_bytes());
    digest
        .0
        .iter()
        .fold(0u64, |acc, b| ((acc << 8) | u64::from(*b)) % DELTA_MODULUS) as i64
}

/// Shift a `YYYYMMDD` value by `delta_days`. Returns `None` when the value
/// does not parse as a DICOM date.
pub fn shift_date(yyyymmdd: &str, delta_days: i64) -> Option<String> {
    let date = NaiveDate::parse_from_str(yyyymmdd.trim(), "%Y%m%d").ok()?;
    let shifted = date.checked_add_signed(Duration::days(delta_days))?;
    Some(shifted.format("%Y%m%d").to_string())
}

/// Round an age string of the form `NNN[DWMY]` to the nearest multiple of
/// `width`, half-up, preserving digit width and the unit suffix.
pub fn round_age(value: &str, width: u32) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || width == 0 {
        return None;
    }
    let (digits, unit) = match value.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            if !matches!(c.to_ascii_uppercase(), 'D' | 'W' | 'M' | 'Y') {
                return None;
            }
            (&value[..idx], &value[idx..])
        }
        _ => (value, ""),
    };
    let n: u32 = digits.parse().ok()?;
    let rounded = ((n + width / 2) / width) * width;
    Some(format!(
        "{:0pad$}{}",
        rounded,
        unit,
        pad = digits.len().max(1)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn delta_is_md5_mod_3652() {
        // digests computed with a reference MD5 implementation
        assert_eq!(date_delta_for("X123"), 154);
        assert_eq!(date_delta_for("Y999"), 601);
        assert_eq!(date_delta_for(""), 1582);
        assert_eq!(date_delta_for("patient-001"), 2463);
    }

    #[test]
    fn delta_is_stable_and_bounded() {
        for id in ["a", "b", "0001", "X123"] {
            let d = date_delta_for(id);
            assert_eq!(d, date_delta_for(id));
            assert!((0..3652).contains(&d));
        }
    }

    #[test]
    fn shifting_dates() {
        assert_eq!(shift_date("20200115", 154).as_deref(), Some("20200617"));
        assert_eq!(shift_date("20200115", 0).as_deref(), Some("20200115"));
        // leap day handled by the calendar
        assert_eq!(shift_date("20200228", 1).as_deref(), Some("20200229"));
        assert_eq!(shift_date("not-a-date", 5), None);
        assert_eq!(shift_date("", 5), None);
    }

    #[rstest]
    #[case("063Y", 5, "065Y")]
    #[case("062Y", 5, "060Y")]
    #[case("067Y", 5, "065Y")]
    #[case("068Y", 5, "070Y")]
    #[case("45", 10, "50")]
    #[case("012M", 6, "012M")]
    #[case("003W", 4, "004W")]
    fn rounding_is_half_up(#[case] input: &str, #[case] width: u32, #[case] expected: &str) {
        assert_eq!(round_age(input, width).as_deref(), Some(expected));
    }

    #[test]
    fn rounding_rejects_junk() {
        assert_eq!(round_age("ABC", 5), None);
        assert_eq!(round_age("12Q", 5), None);
        assert_eq!(round_age("", 5), None);
        assert_eq!(round_age("063Y", 0), None);
    }
}
