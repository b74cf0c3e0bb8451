//! Request-body encoding for the HTTP remote data endpoint (§4.4/§6).

use campaign_core::GetRequest;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// `[A-Za-z0-9-_.~/]` pass through unescaped; everything else is
/// percent-encoded. `NON_ALPHANUMERIC` escapes every non-alphanumeric byte,
/// so the safe set is built by removing the characters the spec exempts.
const SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

pub fn percent_encode(value: &str) -> String {
    utf8_percent_encode(value, SAFE).to_string()
}

/// Builds the form-urlencoded GET body. Field order is unspecified by the
/// wire contract (the receiver is permissive); this emits them in the order
/// listed in §4.4 for readability.
pub fn build_body(filename: &str, row_major: bool, request: &GetRequest) -> String {
    let mut parts = vec![
        format!("Filename={}", percent_encode(filename)),
        format!("RMOrder={}", if row_major { 1 } else { 0 }),
        format!("Varname={}", percent_encode(&request.variable_name)),
        format!("StepStart={}", request.step),
        format!("StepCount={}", request.step_count),
        format!("Block={}", request.block_id),
        format!("Dims={}", request.count.len()),
    ];
    for c in &request.count {
        parts.push(format!("Count={c}"));
    }
    for s in &request.start {
        parts.push(format!("Start={s}"));
    }
    parts.push(format!("AccuracyError={}", request.accuracy.error));
    parts.push(format!("AccuracyNorm={}", request.accuracy.norm));
    parts.push(format!(
        "AccuracyRelative={}",
        if request.accuracy.relative { 1 } else { 0 }
    ));
    parts.join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use campaign_core::AccuracyRequirement;

    #[test]
    fn safe_characters_pass_through_unescaped() {
        assert_eq!(percent_encode("sim.bp/data-0_1~a"), "sim.bp/data-0_1~a");
    }

    #[test]
    fn unsafe_characters_are_percent_encoded() {
        assert_eq!(percent_encode("a b&c=d"), "a%20b%26c%3Dd");
    }

    #[test]
    fn body_includes_repeated_count_and_start_fields() {
        let request = GetRequest {
            variable_name: "temperature".into(),
            step: 3,
            step_count: 1,
            block_id: 0,
            count: vec![4, 4],
            start: vec![0, 0],
            accuracy: AccuracyRequirement::default(),
        };
        let body = build_body("sim.bp", false, &request);
        assert!(body.contains("Filename=sim.bp"));
        assert!(body.contains("Varname=temperature"));
        assert_eq!(body.matches("Count=4").count(), 2);
        assert_eq!(body.matches("Start=0").count(), 2);
        assert!(body.contains("RMOrder=0"));
        assert!(body.contains("StepStart=3"));
    }
}
