#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::sync::Arc;
#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use xenos_gpu::registers::*;
#[cfg(not(target_arch = "wasm32"))]
use xenos_gpu::{
    CommandProcessor, CommandProcessorConfig, NullBackend, NullShaderTranslator, PrimitiveType,
    ShaderType, VecGuestMemory,
};

#[cfg(not(target_arch = "wasm32"))]
const MEMORY_SIZE: usize = 16 << 20;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("XENOS_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn processor() -> CommandProcessor<NullBackend> {
    let config = CommandProcessorConfig {
        shared_memory_size: MEMORY_SIZE as u64,
        ..CommandProcessorConfig::default()
    };
    let mut cp = CommandProcessor::new(
        NullBackend::default(),
        Arc::new(VecGuestMemory::new(MEMORY_SIZE)),
        config,
        Box::new(NullShaderTranslator),
    )
    .unwrap();
    cp.write_register(RB_MODECONTROL, 4);
    cp.write_register(RB_SURFACE_INFO, 1280);
    cp.write_register(PA_SC_WINDOW_SCISSOR_BR, (720 << 16) | 1280);
    cp.write_register(RB_COLOR_MASK, 0xF);
    let vs = cp.load_shader(ShaderType::Vertex, 0x1000, &[1, 2, 3]);
    let ps = cp.load_shader(ShaderType::Pixel, 0x2000, &[4, 5, 6]);
    cp.set_active_shaders(Some(vs), Some(ps));
    cp
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_register_writes(c: &mut Criterion) {
    // One float constant page plus fixed-function state, as a title would
    // write between two draws.
    let writes: Vec<(u32, u32)> = (0..FLOAT_PAGE_DWORDS)
        .map(|i| (SHADER_CONSTANT_000_X + i, (i as f32).to_bits()))
        .chain([
            (PA_CL_VPORT_XSCALE, 640.0f32.to_bits()),
            (PA_CL_VPORT_XOFFSET, 640.0f32.to_bits()),
            (RB_BLEND_RED, 0.5f32.to_bits()),
            (RB_STENCILREFMASK, 0x80),
        ])
        .collect();

    let mut group = c.benchmark_group("register_writes");
    group.throughput(Throughput::Elements(writes.len() as u64));
    group.bench_function("shadow_only", |b| {
        let mut cp = processor();
        b.iter(|| {
            for &(index, value) in &writes {
                cp.write_register(black_box(index), black_box(value));
            }
        })
    });
    group.bench_function("writes_then_draw", |b| {
        b.iter_batched(
            processor,
            |mut cp| {
                for &(index, value) in &writes {
                    cp.write_register(index, value);
                }
                black_box(cp.issue_draw(PrimitiveType::TriangleList, 3, None).unwrap());
                cp
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_register_writes
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
