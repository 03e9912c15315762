use criterion::{black_box, criterion_group, criterion_main, Criterion};
use oscen_live::render::render;
use oscen_live::{NodeKind, PortRef, Runtime, RuntimeConfig, Waveform};

fn voice(rt: &mut Runtime, freq: f32) {
    let root = rt.root();
    let output = rt.output().unwrap();
    let pitch = rt
        .add_node(root, NodeKind::custom(format!("hz:num = {}", freq)))
        .unwrap();
    let osc = rt.add_node(root, NodeKind::oscillator(Waveform::Saw)).unwrap();
    let lowpass = rt.add_node(root, NodeKind::Lowpass).unwrap();
    let cutoff = rt
        .add_node(root, NodeKind::custom("hz:num = 1200 + 800 * sin(0.5)"))
        .unwrap();
    rt.connect(PortRef::new(pitch, "hz"), PortRef::new(osc, "freq")).unwrap();
    rt.connect(PortRef::new(osc, "out"), PortRef::new(lowpass, "in")).unwrap();
    rt.connect(PortRef::new(cutoff, "hz"), PortRef::new(lowpass, "cutoff")).unwrap();
    rt.connect(PortRef::new(lowpass, "out"), PortRef::new(output, "value")).unwrap();
}

fn bench_generate(c: &mut Criterion) {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    for i in 0..8 {
        voice(&mut rt, 110.0 * (i + 1) as f32);
    }
    rt.compile().unwrap();
    let mut processor = rt.processor();
    let mut block = [0.0f32; 512];

    c.bench_function("generate 8 voices, 512 samples", |b| {
        b.iter(|| {
            processor.process_block(black_box(&mut block));
        })
    });
}

fn bench_compile(c: &mut Criterion) {
    c.bench_function("full compile 8 voices", |b| {
        let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
        for i in 0..8 {
            voice(&mut rt, 110.0 * (i + 1) as f32);
        }
        rt.compile().unwrap();
        b.iter(|| {
            rt.schedule_full_compile();
            black_box(rt.compile().unwrap());
        })
    });
}

fn bench_render(c: &mut Criterion) {
    let mut rt = Runtime::new(RuntimeConfig::default()).unwrap();
    voice(&mut rt, 220.0);
    rt.compile().unwrap();
    let mut processor = rt.processor();
    c.bench_function("render one second", |b| {
        b.iter(|| black_box(render(&mut processor, 44100)))
    });
}

criterion_group!(benches, bench_generate, bench_compile, bench_render);
criterion_main!(benches);
