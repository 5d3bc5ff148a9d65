use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mavparam::protocol::{decode, encode_param_set, encode_param_value, Endpoint, FrameHeader, MavlinkCodec};
use mavparam::{ParamType, ParamValue};
use tokio_util::codec::Decoder;

fn header(sequence: u8) -> FrameHeader {
    FrameHeader { sequence, source: Endpoint::new(1, 1) }
}

/// A full parameter table as a vehicle would stream it
fn param_table(count: u16) -> Vec<u8> {
    let mut bytes = Vec::new();
    for index in 0..count {
        let name = format!("PARAM_{:04}", index);
        let frame = if index % 2 == 0 {
            encode_param_value(header(index as u8), &name, ParamValue::Int(index as i64), ParamType::Int32, index, count)
        } else {
            encode_param_value(header(index as u8), &name, ParamValue::Float(index as f32 * 0.5), ParamType::Real32, index, count)
        };
        bytes.extend(frame.unwrap_or_default());
    }
    bytes
}

fn benchmark_encode_set(c: &mut Criterion) {
    let gcs = FrameHeader { sequence: 0, source: Endpoint::new(255, 190) };

    c.bench_function("encode_param_set", |b| {
        b.iter(|| {
            encode_param_set(
                black_box(gcs),
                black_box(Endpoint::new(1, 1)),
                black_box("MPC_XY_VEL_MAX"),
                ParamValue::Float(12.0),
                ParamType::Real32,
            )
        });
    });
}

fn benchmark_decode_table(c: &mut Criterion) {
    let table = param_table(1000);

    c.bench_function("decode_1000_param_values", |b| {
        b.iter(|| {
            let mut rest = black_box(table.as_slice());
            let mut decoded = 0;
            loop {
                let (consumed, packet) = decode(rest);
                if consumed == 0 {
                    break;
                }
                decoded += packet.is_some() as usize;
                rest = &rest[consumed..];
            }
            decoded
        });
    });

    c.bench_function("codec_decode_1000_param_values", |b| {
        b.iter(|| {
            let mut codec = MavlinkCodec::new(Endpoint::new(255, 190));
            let mut buffer = BytesMut::from(black_box(table.as_slice()));
            let mut decoded = 0;
            while let Ok(Some(_)) = codec.decode(&mut buffer) {
                decoded += 1;
            }
            decoded
        });
    });
}

criterion_group!(benches, benchmark_encode_set, benchmark_decode_table);
criterion_main!(benches);
