// BSON build/parse benchmarks
use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use mongoflux::bson::{BsonDocument, BsonValue, DocumentBuilder};
use mongoflux::protocol::{Query, QueryFlags, Request};
use mongoflux::rope::ByteRope;

#[derive(Debug, Clone, Copy)]
enum DocumentSize {
    Small,
    Medium,
    Large,
}

fn generate_document(size: DocumentSize) -> BsonDocument {
    let fields = match size {
        DocumentSize::Small => 4,
        DocumentSize::Medium => 32,
        DocumentSize::Large => 256,
    };
    let mut builder = DocumentBuilder::new()
        .utf8("name", "benchmark-document")
        .unwrap()
        .double("score", 42.0)
        .unwrap()
        .array(
            "tags",
            &[
                BsonValue::Utf8("one".into()),
                BsonValue::Utf8("two".into()),
                BsonValue::Int32(3),
            ],
        )
        .unwrap();
    for i in 0..fields {
        builder = builder.int64(&format!("field_{i}"), i as i64).unwrap();
    }
    builder
        .binary("payload", 0x00, Bytes::from(vec![0xab; 64]))
        .unwrap()
        .finish()
        .unwrap()
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("bson_build");
    for size in [DocumentSize::Small, DocumentSize::Medium, DocumentSize::Large] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size:?}")),
            &size,
            |b, &size| {
                b.iter(|| black_box(generate_document(size)));
            },
        );
    }
    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("bson_parse");
    for size in [DocumentSize::Small, DocumentSize::Medium, DocumentSize::Large] {
        let bytes = generate_document(size).to_bytes();
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{size:?}")),
            &bytes,
            |b, bytes| {
                b.iter(|| {
                    let doc =
                        BsonDocument::from_rope(ByteRope::from_bytes(bytes.clone())).unwrap();
                    let mut count = 0usize;
                    for field in doc.fields() {
                        let _ = black_box(field.unwrap());
                        count += 1;
                    }
                    black_box(count)
                });
            },
        );
    }
    group.finish();
}

fn bench_frame_encode(c: &mut Criterion) {
    let query = generate_document(DocumentSize::Medium);
    c.bench_function("frame_encode_query", |b| {
        b.iter(|| {
            let request = Request::Query(Query {
                namespace: "bench.collection".into(),
                flags: QueryFlags::SLAVE_OK,
                number_to_skip: 0,
                number_to_return: 100,
                query: query.clone(),
                return_fields: None,
            });
            black_box(request.encode(1, usize::MAX).unwrap().len())
        });
    });
}

criterion_group!(benches, bench_build, bench_parse, bench_frame_encode);
criterion_main!(benches);
