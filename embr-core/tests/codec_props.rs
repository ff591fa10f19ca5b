//! Property tests for the payload codecs, the Parquet round trip, and hashing

use embr_core::codec::{decode_vector, encode_npy, encode_raw};
use embr_core::object::{decode_object, encode_object};
use embr_core::parquet::{forward, inverse, Transformed};
use embr_core::store::{resolve_among, ObjectStore};
use embr_core::{EmbrError, Metadata, ObjectHash};
use proptest::prelude::*;
use tempfile::TempDir;

fn values() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(-1.0e6f32..1.0e6f32, 1..64)
}

fn parquet_round_trip(payload: &[u8]) -> Vec<u8> {
    let (_, native) = encode_object(payload, 3).unwrap();
    match forward(&native, None, None).unwrap() {
        Transformed::Parquet(bytes) => inverse(&bytes).unwrap().payload,
        Transformed::Passthrough(_) => panic!("vector payload passed through"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_raw_payload_round_trips(v in values()) {
        let payload = encode_raw(&v);
        prop_assert_eq!(parquet_round_trip(&payload), payload.clone());
        prop_assert_eq!(decode_vector(&payload).unwrap().0, v);
    }

    #[test]
    fn test_npy_payload_round_trips(v in values()) {
        let payload = encode_npy(&v);
        prop_assert_eq!(parquet_round_trip(&payload), payload);
    }

    #[test]
    fn test_object_encoding_is_stable(data in prop::collection::vec(any::<u8>(), 1..2048), level in 1i32..10) {
        let (h1, bytes) = encode_object(&data, level).unwrap();
        let (h2, _) = encode_object(&data, level).unwrap();
        prop_assert_eq!(h1, h2);
        prop_assert_eq!(h1, ObjectHash::from_data(&data));
        prop_assert_eq!(decode_object(&bytes).unwrap().payload, data);
    }

    #[test]
    fn test_store_dedups_and_separates(a in values(), b in values()) {
        let temp_dir = TempDir::new().unwrap();
        let store = ObjectStore::new(temp_dir.path().join("objects"));
        let (pa, pb) = (encode_raw(&a), encode_raw(&b));
        let ha = store.write(&pa, &Metadata::new()).unwrap();
        prop_assert_eq!(store.write(&pa, &Metadata::new()).unwrap(), ha);
        let hb = store.write(&pb, &Metadata::new()).unwrap();
        prop_assert_eq!(ha == hb, pa == pb);
    }

    #[test]
    fn test_prefix_ambiguity(payloads in prop::collection::vec(prop::collection::vec(any::<u8>(), 1..32), 1..24), len in 1usize..3) {
        let hashes: Vec<ObjectHash> = payloads.iter().map(|p| ObjectHash::from_data(p)).collect();
        let prefix = hashes[0].to_hex()[..len].to_string();
        let mut matching: Vec<ObjectHash> = hashes
            .iter()
            .copied()
            .filter(|h| h.to_hex().starts_with(&prefix))
            .collect();
        matching.sort();
        matching.dedup();
        match resolve_among(&prefix, hashes.iter().copied()) {
            Ok(h) => {
                prop_assert_eq!(matching.len(), 1);
                prop_assert_eq!(h, hashes[0]);
            }
            Err(EmbrError::HashAmbiguous { candidates, .. }) => {
                prop_assert!(matching.len() >= 2);
                prop_assert_eq!(candidates.len(), matching.len());
            }
            Err(e) => prop_assert!(false, "unexpected error {}", e),
        }
    }
}

#[test]
fn test_npy_hundred_floats_round_trip_with_padding() {
    let values: Vec<f32> = (0..100).map(|i| i as f32 * 0.25).collect();
    let payload = encode_npy(&values);
    assert_eq!((payload.len() - 100 * 4) % 64, 0);
    assert_eq!(parquet_round_trip(&payload), payload);
}
