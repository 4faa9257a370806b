use criterion::{black_box, criterion_group, criterion_main, Criterion};
use detector_models::{
    DetectorElement, ElementId, Measurement, MeasurementId, MeasurementIndex, PlaneSurface, Region,
    SpacePoint, SurfaceId, Technology,
};
use finder_core::{
    ClaimIndex, CombinatorialFinder, FinderConfig, FinderData, LocalVec, PatternParameters,
    RoadSeed, Seed, SeedHits,
};
use nalgebra::{Vector2, Vector3};
use std::f64::consts::FRAC_PI_2;

/// Straight road of `n` pixel modules along x with one hit per module and
/// a few off-track hits to rank.
fn make_road(n: u64) -> (Vec<DetectorElement>, MeasurementIndex) {
    let road: Vec<DetectorElement> = (0..n)
        .map(|i| DetectorElement {
            id: ElementId(i),
            technology: Technology::Pixel,
            region: Region::Barrel,
            surface: PlaneSurface::from_normal(
                SurfaceId(i),
                Vector3::new(50.0 + 40.0 * i as f64, 0.0, 0.0),
                Vector3::x(),
                Vector3::z(),
            ),
            half_width: 20.0,
            half_length: 30.0,
            disabled: false,
        })
        .collect();
    let mut index = MeasurementIndex::new();
    for i in 0..n {
        index.insert(Measurement::pixel(
            MeasurementId(i + 1),
            ElementId(i),
            Vector2::zeros(),
            0.01,
            0.05,
        ));
        for k in 0..3u64 {
            index.insert(Measurement::pixel(
                MeasurementId(1000 + 3 * i + k),
                ElementId(i),
                Vector2::new(2.0 + 3.0 * k as f64, -1.0),
                0.01,
                0.05,
            ));
        }
    }
    (road, index)
}

fn make_seed(road: &[DetectorElement]) -> Seed {
    Seed {
        parameters: PatternParameters::new(
            road[0].surface,
            LocalVec::new(0.0, 0.0, 0.0, FRAC_PI_2, 1e-4),
            None,
        ),
        hits: SeedHits::SpacePoints(
            (1..=3u64)
                .map(|id| SpacePoint {
                    first: MeasurementId(id),
                    second: None,
                    position: Vector3::new(10.0 + 40.0 * id as f64, 0.0, 0.0),
                })
                .collect(),
        ),
    }
}

fn bench_get_tracks(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_tracks");
    let finder = CombinatorialFinder::new(FinderConfig::default());

    for n in [9, 20, 40] {
        let (road, index) = make_road(n);
        let seed = make_seed(&road);
        let claims = ClaimIndex::new();
        group.bench_function(format!("{n}_modules"), |b| {
            let mut data = FinderData::new();
            b.iter(|| {
                black_box(
                    finder
                        .get_tracks(&mut data, &road, &index, &seed, &claims)
                        .ok(),
                );
            });
        });
    }

    group.finish();
}

fn bench_parallel(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_tracks_parallel");
    let finder = CombinatorialFinder::new(FinderConfig::default());
    let (road, index) = make_road(12);

    for n in [16, 128, 512] {
        let seeds: Vec<RoadSeed> = (0..n)
            .map(|_| RoadSeed {
                road: road.clone(),
                seed: make_seed(&road),
            })
            .collect();
        let claims = ClaimIndex::new();
        group.bench_function(format!("{n}_seeds"), |b| {
            b.iter(|| black_box(finder.find_tracks_parallel(&seeds, &index, &claims).ok()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_get_tracks, bench_parallel);
criterion_main!(benches);
