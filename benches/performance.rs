//! Performance benchmarks for scanner output handling

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scap_runner::{
    capabilities::Capabilities,
    progress::{Decoded, ProgressParser},
    request::{build_evaluation_args, ArtifactKind, EvaluationPaths, ScanRequest},
};
use std::collections::BTreeMap;

const RESULTS: [&str; 5] = ["pass", "fail", "notapplicable", "notselected", "error"];

/// Scanner stdout with `rules` progress records
fn progress_stream(rules: usize) -> Vec<u8> {
    let mut out = String::new();
    for i in 0..rules {
        out.push_str(&format!(
            "xccdf_org.ssgproject.content_rule_generated_{}:{}\n",
            i,
            RESULTS[i % RESULTS.len()]
        ));
    }
    out.into_bytes()
}

/// Benchmark progress decoding across read sizes
fn bench_progress_parsing(c: &mut Criterion) {
    let stream = progress_stream(5_000);
    let mut group = c.benchmark_group("progress_parsing");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [1usize, 64, 8192] {
        group.bench_with_input(BenchmarkId::new("chunk", chunk_size), &chunk_size, |b, &size| {
            b.iter(|| {
                let mut parser = ProgressParser::new();
                let mut records = 0usize;
                for chunk in stream.chunks(size) {
                    parser
                        .feed(black_box(chunk), |decoded| {
                            if let Decoded::Progress(_) = decoded {
                                records += 1;
                            }
                        })
                        .unwrap();
                }
                black_box(records)
            })
        });
    }

    group.finish();
}

/// Benchmark version banner parsing
fn bench_capability_parsing(c: &mut Criterion) {
    let banner = "OpenSCAP command line tool (oscap) 1.3.5\n\
                  Copyright 2009--2021 Red Hat Inc., Durham, North Carolina.\n\
                  \n\
                  ==== Supported specifications ====\n\
                  SCAP Version: 1.3\n\
                  XCCDF Version: 1.2\n\
                  OVAL Version: 5.11.2\n\
                  CPE Version: 2.3\n\
                  \n\
                  ==== Capabilities added by auto-loaded plugins ====\n\
                  SCE Version: 1.0 (from libopenscap_sce.so.25)\n";

    c.bench_function("capability_banner", |b| {
        b.iter(|| black_box(Capabilities::parse(black_box(banner)).unwrap()))
    });
}

/// Benchmark command line construction
fn bench_command_building(c: &mut Criterion) {
    let request = ScanRequest::local("/usr/share/xml/scap/ssg/content/ssg-rhel9-ds.xml", "ospp");
    let outputs: BTreeMap<_, _> = ArtifactKind::ALL
        .iter()
        .map(|kind| (*kind, format!("/tmp/out/{}", kind.remote_name())))
        .collect();
    let paths = EvaluationPaths {
        input: request.input.display().to_string(),
        tailoring: None,
        outputs,
    };

    c.bench_function("evaluation_args", |b| {
        b.iter(|| black_box(build_evaluation_args(Some("xccdf"), &request, &paths, true)))
    });
}

criterion_group!(
    benches,
    bench_progress_parsing,
    bench_capability_parsing,
    bench_command_building
);

criterion_main!(benches);
