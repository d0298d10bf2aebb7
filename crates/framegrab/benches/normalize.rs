use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use framegrab::{PixelFormat, normalize};

/// Create a packed test frame with a gradient pattern
fn create_test_frame(width: u32, height: u32, bytes_per_pixel: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(width as usize * height as usize * bytes_per_pixel);

    for y in 0..height {
        for x in 0..width {
            let value = (((x + y) * 255) / (width + height)) as u8;
            for channel in 0..bytes_per_pixel {
                data.push(value.wrapping_add(channel as u8 * 40));
            }
        }
    }

    data
}

fn benchmark_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    let sizes = [
        (640, 480, "VGA"),
        (1280, 720, "HD"),
        (1920, 1080, "Full HD"),
    ];

    let formats = [PixelFormat::Yuyv422, PixelFormat::Rgb24, PixelFormat::Gray8];

    for (width, height, label) in sizes {
        group.throughput(Throughput::Elements((width * height) as u64));

        for format in formats {
            let Some(bytes_per_pixel) = format.bytes_per_pixel() else {
                continue;
            };
            let raw = create_test_frame(width, height, bytes_per_pixel);

            group.bench_with_input(BenchmarkId::new(format.as_str(), label), &raw, |b, raw| {
                b.iter(|| normalize(black_box(raw.clone()), width, height, format))
            });
        }
    }

    group.finish();
}

criterion_group!(benches, benchmark_normalize);
criterion_main!(benches);
