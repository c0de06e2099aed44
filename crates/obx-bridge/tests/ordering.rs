use obx_bridge::{LocalPorts, MessagePort, Payload};
use proptest::prelude::*;
use std::collections::HashMap;
use std::thread;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn messages_from_one_producer_keep_their_order(
        counts in prop::collection::vec(0usize..200, 1..6),
    ) {
        let ports = LocalPorts::new(0);
        let rx = ports.open();
        let port = rx.id();

        let producers: Vec<_> = counts
            .iter()
            .enumerate()
            .map(|(producer, count)| {
                let ports = ports.clone();
                let count = *count;
                thread::spawn(move || {
                    for seq in 0..count {
                        let accepted = ports.post(
                            port,
                            Payload::ints([producer as i64, seq as i64]),
                        );
                        assert!(accepted);
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().expect("producer thread");
        }

        let mut next: HashMap<i64, i64> = HashMap::new();
        for payload in rx.drain() {
            let pair = payload.as_array().expect("array payload");
            let (producer, seq) = (
                pair[0].as_int().expect("producer"),
                pair[1].as_int().expect("seq"),
            );
            let expected = next.entry(producer).or_insert(0);
            prop_assert_eq!(seq, *expected);
            *expected += 1;
        }
        for (producer, count) in counts.iter().enumerate() {
            prop_assert_eq!(
                next.get(&(producer as i64)).copied().unwrap_or(0),
                *count as i64
            );
        }
    }
}
