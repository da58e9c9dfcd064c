//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Property checks for per-node image reassembly."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use ugate_core::{ChunkOutcome, ImageReassembler, ReassemblyPolicy, TransferState};
use ugate_protocol::{CommandCode, DataFrame, NodeAddress};

fn jpeg(len: usize) -> Vec<u8> {
    let mut image = vec![0xFF, 0xD8];
    image.extend((0..len).map(|i| (i % 251) as u8));
    image.extend([0xFF, 0xD9]);
    image
}

fn chunk(source: NodeAddress, data: &[u8]) -> DataFrame {
    let mut payload = vec![29, 0, 5, 5, 5, 5, 5];
    payload.extend_from_slice(data);
    DataFrame::new(source, -30, payload)
}

fn reassemble(
    reassembler: &ImageReassembler,
    source: NodeAddress,
    image: &[u8],
    chunk_len: usize,
) -> Vec<u8> {
    let now = Instant::now();
    let mut result = None;
    for piece in image.chunks(chunk_len) {
        let report = reassembler
            .handle_chunk(&chunk(source, piece), CommandCode::CamTakePic, now)
            .expect("chunk accepted");
        if let ChunkOutcome::Materialized(capture) = report.outcome {
            result = Some(capture.bytes);
        }
    }
    result.expect("image materialized")
}

#[test]
fn any_chunking_preserves_bytes_and_length() {
    let reassembler = ImageReassembler::new(ReassemblyPolicy::default());
    let node = NodeAddress::new(0x3333);
    // Body bytes never contain 0xFF and every opening chunk holds at least two bytes.
    for (body, chunk_len) in [(10, 3), (64, 7), (200, 64), (1, 2), (500, 2)] {
        let image = jpeg(body);
        let bytes = reassemble(&reassembler, node, &image, chunk_len);
        assert_eq!(bytes.len(), image.len(), "body {body} chunk {chunk_len}");
        assert_eq!(bytes, image);
        assert_eq!(reassembler.state(node), TransferState::Idle);
    }
}

#[test]
fn concurrent_nodes_never_interleave() {
    let reassembler = Arc::new(ImageReassembler::new(ReassemblyPolicy::default()));
    let handles: Vec<_> = (0..4u16)
        .map(|n| {
            let reassembler = reassembler.clone();
            thread::spawn(move || {
                let node = NodeAddress::new(0x1000 + n);
                let image = jpeg(300 + usize::from(n) * 17);
                let bytes = reassemble(&reassembler, node, &image, 5 + usize::from(n));
                (bytes, image)
            })
        })
        .collect();

    for handle in handles {
        let (bytes, image) = handle.join().expect("worker finished");
        assert_eq!(bytes, image);
    }
    assert_eq!(reassembler.open_transfers(), 0);
}
