use criterion::{Criterion, criterion_group, criterion_main};
use mcp_probe::framing::{FrameAssembler, LineFramer};

fn bench_line_framing(c: &mut Criterion) {
    let line = br#"{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo a message back","inputSchema":{"type":"object"}}]}}"#;
    let mut payload = Vec::new();
    for _ in 0..200 {
        payload.extend_from_slice(line);
        payload.push(b'\n');
    }

    c.bench_function("frame_200_lines_64b_chunks", |b| {
        b.iter(|| {
            let mut framer = FrameAssembler::new(LineFramer::json(1024 * 1024));
            let mut frames = 0;
            for chunk in payload.chunks(64) {
                frames += framer.on_data(chunk).len();
            }
            assert_eq!(frames, 200);
        })
    });
}

criterion_group!(benches, bench_line_framing);
criterion_main!(benches);
