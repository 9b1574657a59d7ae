//! Content fingerprints
//!
//! A fingerprint is the SHA-256 of a canonical encoding of everything that
//! determines a generation: stage identifier (route included), the ordered
//! input references, both prompt templates and the model config. Templates
//! and configs enter as content keys (`name@vN#digest`), so the fingerprint
//! follows their content even when a version number is reused.
//! Every field is length-prefixed so no two distinct requests can encode to
//! the same byte string.

use filingforge_common::types::{Fingerprint, InputRef, StageId};
use sha2::{Digest, Sha256};

/// Bumped whenever the encoding below changes
pub const ENCODING_VERSION: u8 = 2;

const DOMAIN_TAG: &[u8] = b"filingforge/fingerprint";

/// Compute the fingerprint of a generation request. Input order is significant.
pub fn compute(
    stage_id: StageId,
    inputs: &[InputRef],
    system_prompt_key: &str,
    user_prompt_key: &str,
    model_config_key: &str,
) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_TAG);
    hasher.update([ENCODING_VERSION]);

    write_field(&mut hasher, stage_id.to_string().as_bytes());

    hasher.update((inputs.len() as u64).to_be_bytes());
    for input in inputs {
        write_field(&mut hasher, input.to_string().as_bytes());
    }

    write_field(&mut hasher, system_prompt_key.as_bytes());
    write_field(&mut hasher, user_prompt_key.as_bytes());
    write_field(&mut hasher, model_config_key.as_bytes());

    let digest: [u8; 32] = hasher.finalize().into();
    Fingerprint::from_digest(&digest)
}

fn write_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_be_bytes());
    hasher.update(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use filingforge_common::types::Stage;
    use uuid::Uuid;

    fn doc(n: u128) -> InputRef {
        InputRef::Document(Uuid::from_u128(n))
    }

    fn fp(stage: StageId, inputs: &[InputRef]) -> Fingerprint {
        compute(stage, inputs, "sys@v1", "usr@v1", "extraction@v1")
    }

    #[test]
    fn test_stable_and_well_formed() {
        let stage = StageId::full(Stage::DocumentSummary);
        let a = fp(stage, &[doc(1)]);
        let b = fp(stage, &[doc(1)]);

        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
        assert!(Fingerprint::from_hex(a.as_str()).is_ok());
    }

    #[test]
    fn test_every_field_participates() {
        let stage = StageId::full(Stage::PeriodAggregate);
        let base = fp(stage, &[doc(1), doc(2)]);

        assert_ne!(base, fp(StageId::full(Stage::Brief), &[doc(1), doc(2)]));
        assert_ne!(base, fp(stage, &[doc(1)]));
        assert_ne!(base, compute(stage, &[doc(1), doc(2)], "sys@v2", "usr@v1", "extraction@v1"));
        assert_ne!(base, compute(stage, &[doc(1), doc(2)], "sys@v1", "usr@v2", "extraction@v1"));
        assert_ne!(base, compute(stage, &[doc(1), doc(2)], "sys@v1", "usr@v1", "synthesis@v1"));
    }

    #[test]
    fn test_input_order_matters() {
        let stage = StageId::full(Stage::PeriodAggregate);
        assert_ne!(fp(stage, &[doc(1), doc(2)]), fp(stage, &[doc(2), doc(1)]));
    }

    #[test]
    fn test_route_is_part_of_identity() {
        let full = fp(StageId::full(Stage::DocumentSummary), &[doc(1)]);
        let single = fp(StageId::single_pass(Stage::DocumentSummary), &[doc(1)]);
        assert_ne!(full, single);
    }

    #[test]
    fn test_input_kind_matters() {
        let stage = StageId::full(Stage::Brief);
        let id = Uuid::from_u128(9);
        assert_ne!(
            fp(stage, &[InputRef::Document(id)]),
            fp(stage, &[InputRef::Content(id)])
        );
    }

    #[test]
    fn test_field_boundaries_are_unambiguous() {
        let stage = StageId::full(Stage::Brief);
        let a = compute(stage, &[], "ab", "c", "m");
        let b = compute(stage, &[], "a", "bc", "m");
        assert_ne!(a, b);
    }
}
