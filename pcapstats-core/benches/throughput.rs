use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pcapstats_core::config::Config;
use pcapstats_core::Pipeline;

fn eth_header(ethertype: u16) -> Vec<u8> {
    let mut f = vec![0u8; 12];
    f.extend_from_slice(&ethertype.to_be_bytes());
    f
}

fn tcp_frame(src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16, seq: u32, flags: u8) -> Vec<u8> {
    let mut tcp = vec![0u8; 20];
    tcp[0..2].copy_from_slice(&sport.to_be_bytes());
    tcp[2..4].copy_from_slice(&dport.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[12] = 5 << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&4096u16.to_be_bytes());

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    let total_len = (20 + tcp.len()) as u16;
    ip[2..4].copy_from_slice(&total_len.to_be_bytes());
    ip[9] = 6; // TCP
    ip[12..16].copy_from_slice(&src);
    ip[16..20].copy_from_slice(&dst);

    let mut frame = eth_header(0x0800);
    frame.extend(ip);
    frame.extend(tcp);
    frame
}

fn bench_flow_table_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_table_fanout");
    for hosts in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(hosts), &hosts, |b, &hosts| {
            b.iter(|| {
                let config = Config::default();
                let mut pipeline = Pipeline::new(&config);
                for i in 0..hosts {
                    let dst = [10, 0, (i >> 8) as u8, (i & 0xff) as u8];
                    let frame = tcp_frame([10, 0, 0, 1], dst, 1111, 80, 1000, 0x02);
                    pipeline.handle(&frame, 0);
                }
            });
        });
    }
    group.finish();
}

fn bench_same_flow_reuse(c: &mut Criterion) {
    c.bench_function("same_flow_repeated_packets", |b| {
        let config = Config::default();
        let mut pipeline = Pipeline::new(&config);
        let frame = tcp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1111, 80, 1000, 0x10);
        b.iter(|| pipeline.handle(&frame, 0));
    });
}

criterion_group!(benches, bench_flow_table_fanout, bench_same_flow_reuse);
criterion_main!(benches);
