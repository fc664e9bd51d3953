//! Prebuffering and loopback exchange benchmarks.

use bklight_client::{DisplaySession, LoopbackConnector, PanelBehavior, SessionConfig};
use bklight_panels::config::{PanelEntry, PanelEntryConfig};
use bklight_panels::{AppConfig, PanelManager};
use bklight_protocol::Frame;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use image::{Rgb, RgbImage};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Mutex;

const ADDRESS: &str = "AA:AA:AA:AA:AA:01";

fn canvas(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 5 % 256) as u8, (y * 9 % 256) as u8, ((x ^ y) * 3 % 256) as u8])
    })
}

fn grid_config(columns: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.panels.list = (0..columns)
        .map(|x| {
            PanelEntry::Detailed(PanelEntryConfig {
                address: Some(format!("AA:AA:AA:AA:AA:{:02X}", x + 1)),
                grid_x: x,
                ..PanelEntryConfig::default()
            })
        })
        .collect();
    config.normalize();
    config
}

fn bench_prebuffer(c: &mut Criterion) {
    let mut group = c.benchmark_group("prebuffer_image");

    for columns in [1, 2, 4] {
        let config = grid_config(columns);
        let manager = PanelManager::new(&config, Arc::new(LoopbackConnector::new())).unwrap();
        let (width, height) = manager.canvas_size();
        let image = canvas(width, height);

        group.throughput(Throughput::Elements(columns as u64));
        group.bench_with_input(BenchmarkId::from_parameter(columns), &image, |b, image| {
            b.iter(|| black_box(manager.prebuffer_image(image).unwrap()));
        });
    }

    group.finish();
}

fn bench_loopback_exchange(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let connector = Arc::new(LoopbackConnector::new());
    connector.add_panel(ADDRESS, PanelBehavior::default());

    let config = SessionConfig::new(ADDRESS).with_streaming_stage_delay(Duration::ZERO);
    let mut session = DisplaySession::new(config, connector).unwrap();
    rt.block_on(session.connect()).unwrap();
    let session = Mutex::new(session);

    let frame = Frame::new(vec![0x5A; 2048]).encode().unwrap().freeze();

    let mut group = c.benchmark_group("loopback_exchange");
    group.throughput(Throughput::Elements(1));
    group.bench_function("streaming", |b| {
        b.to_async(&rt).iter(|| async {
            session
                .lock()
                .await
                .send_frame_streaming(&frame)
                .await
                .unwrap()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_prebuffer, bench_loopback_exchange);
criterion_main!(benches);
