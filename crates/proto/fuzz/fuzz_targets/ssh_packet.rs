//! Fuzz target for SSH packet parsing.
//!
//! Feeds arbitrary bytes to the clear-text packet decoder and the wire
//! reader. Neither may panic or loop; every malformed input must come back
//! as an error or as "need more data".
//!
//! Run with:
//! ```bash
//! cd crates/proto
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use latch_proto::ssh::message::{Disconnect, ExtInfo, GlobalRequest};
use latch_proto::ssh::packet::PacketDecoder;
use latch_proto::ssh::wire::WireReader;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut decoder = PacketDecoder::new(35000);
    let mut buf = BytesMut::from(data);
    while let Ok(Some(packet)) = decoder.decode(&mut buf) {
        let _ = Disconnect::from_bytes(&packet.payload);
        let _ = ExtInfo::from_bytes(&packet.payload);
        let _ = GlobalRequest::from_bytes(&packet.payload);
    }

    let mut reader = WireReader::new(data);
    let _ = reader.read_name_list();
    let _ = reader.read_mpint();
    let _ = reader.read_utf8();
});
