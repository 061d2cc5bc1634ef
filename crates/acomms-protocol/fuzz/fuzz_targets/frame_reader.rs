#![no_main]

use acomms_protocol::frame::{FrameBuilder, FrameReader};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // The reader must never panic on arbitrary modem bytes
    let Ok(reader) = FrameReader::new(data) else {
        return;
    };

    let mut builder = FrameBuilder::new();
    for piece in reader {
        match piece {
            Ok(piece) => {
                // Whatever parsed cleanly must re-stitch cleanly
                let _ = builder.push_piece(piece.stream_id, piece.payload);
            }
            Err(_) => break,
        }
    }

    if !builder.is_empty() {
        let rebuilt = builder.finish();
        if let Ok(reader) = FrameReader::new(&rebuilt) {
            assert!(reader.into_iter().all(|p| p.is_ok()));
        }
    }
});
