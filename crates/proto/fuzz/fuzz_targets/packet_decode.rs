//! Fuzz target for the plaintext packet decoder.
//!
//! Feeds arbitrary bytes to a fresh [`PacketCodec`] and checks that every
//! packet it accepts frames again to the same payload.
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run packet_decode -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use kiln_platform::mock::FixedRandom;
use kiln_proto::ssh::PacketCodec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut codec = PacketCodec::new(35_000);
    let mut buf = BytesMut::from(data);

    while let Ok(Some(packet)) = codec.decode(&mut buf) {
        let mut echo = PacketCodec::new(35_000);
        let wire = echo
            .encode(packet.msg_type(), packet.payload(), &mut FixedRandom(0))
            .expect("encoding a decoded packet should never fail");
        let mut wire = BytesMut::from(&wire[..]);
        let reparsed = echo
            .decode(&mut wire)
            .expect("re-decoding should never fail")
            .expect("re-encoded packet is complete");

        assert_eq!(packet.msg_type(), reparsed.msg_type());
        assert_eq!(packet.payload(), reparsed.payload());
    }
});
