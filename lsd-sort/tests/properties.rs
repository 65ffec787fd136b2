mod common;

use common::{small_config, verify_pairs_preserved, verify_stable};
use lsd_primitives::{create_buffer_with_data, read_vec};
use lsd_sort::{ComputeDevice, RadixSortEngine, SortConfig};
use proptest::prelude::*;

fn config_strategy() -> impl Strategy<Value = SortConfig> {
    prop_oneof![
        Just(small_config()),
        Just(small_config().with_key_bits(12)),
        Just(SortConfig::default()),
        Just(
            SortConfig::default()
                .with_digit_width(3)
                .with_block_count(2)
                .with_threads_per_block(8)
                .with_elements_per_thread(4)
        ),
    ]
}

fn mask(config: &SortConfig, keys: Vec<u32>) -> Vec<u32> {
    let bits = config.key_bits;
    if bits == 32 {
        keys
    } else {
        keys.into_iter().map(|k| k & ((1 << bits) - 1)).collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_sorts_like_std(config in config_strategy(), keys in prop::collection::vec(any::<u32>(), 0..400)) {
        let keys = mask(&config, keys);
        let mut expected = keys.clone();
        expected.sort_unstable();
        let mut actual = keys;
        RadixSortEngine::host(config).unwrap().sort_keys(&mut actual).unwrap();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn prop_sort_is_idempotent(keys in prop::collection::vec(any::<u32>(), 0..300)) {
        let mut engine = RadixSortEngine::host(small_config()).unwrap();
        let mut once = keys;
        engine.sort_keys(&mut once).unwrap();
        let mut twice = once.clone();
        engine.sort_keys(&mut twice).unwrap();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_pairs_are_stable(config in config_strategy(), keys in prop::collection::vec(0u32..32, 0..300)) {
        let values: Vec<u64> = (0..keys.len() as u64).collect();
        let mut sorted_keys = keys.clone();
        let mut sorted_vals = values.clone();
        RadixSortEngine::host(config)
            .unwrap()
            .sort_pairs(&mut sorted_keys, &mut sorted_vals)
            .unwrap();
        prop_assert!(verify_stable(&sorted_keys, &sorted_vals));
        prop_assert!(verify_pairs_preserved(&keys, &values, &sorted_keys, &sorted_vals));
    }

    #[test]
    fn prop_in_place_matches_explicit(
        config in config_strategy(),
        pairs in prop::collection::vec((any::<u32>(), any::<u64>()), 0..200),
    ) {
        let (keys, values): (Vec<u32>, Vec<u64>) = pairs.into_iter().unzip();
        let keys = mask(&config, keys);
        let n = keys.len();
        let mut engine = RadixSortEngine::host(config).unwrap();
        let device = engine.device();
        let k_in = create_buffer_with_data(device, &keys).unwrap();
        let k_out = device.create_buffer(n * 4).unwrap();
        let v_in = create_buffer_with_data(device, &values).unwrap();
        let v_out = device.create_buffer(n * 8).unwrap();
        let k_place = create_buffer_with_data(device, &keys).unwrap();
        let v_place = create_buffer_with_data(device, &values).unwrap();

        engine.keys_with_values(&k_in, &k_out, &v_in, &v_out, n).unwrap();
        engine.keys_with_values_in_place(&k_place, &v_place, n).unwrap();

        let device = engine.device();
        prop_assert_eq!(
            read_vec::<_, u32>(device, &k_out, n).unwrap(),
            read_vec::<_, u32>(device, &k_place, n).unwrap()
        );
        prop_assert_eq!(
            read_vec::<_, u64>(device, &v_out, n).unwrap(),
            read_vec::<_, u64>(device, &v_place, n).unwrap()
        );
    }
}
