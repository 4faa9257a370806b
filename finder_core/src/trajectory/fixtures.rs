//! Straight-line pixel telescope used by the trajectory tests.

use crate::config::FinderConfig;
use crate::parameters::PatternParameters;
use crate::tools::{SearchContext, Tools};
use crate::types::{ElementId, LocalVec, MeasurementId, SurfaceId};
use detector_models::{
    BoundaryLink, DetectorElement, Measurement, MeasurementIndex, PlaneSurface, Region, Technology,
};
use nalgebra::{Vector2, Vector3};
use std::f64::consts::FRAC_PI_2;

pub(crate) struct Telescope {
    pub road: Vec<DetectorElement>,
    pub index: MeasurementIndex,
    next_id: u64,
}

impl Telescope {
    /// Pixel modules at x = 50, 90, 130, ... mm; `hits[i]` is the local x of
    /// the hit on module `i`, whose id is `i + 1`.
    pub fn straight(hits: &[Option<f64>]) -> Self {
        let road = (0..hits.len())
            .map(|i| DetectorElement {
                id: ElementId(i as u64),
                technology: Technology::Pixel,
                region: Region::Barrel,
                surface: PlaneSurface::from_normal(
                    SurfaceId(i as u64),
                    Vector3::new(50.0 + 40.0 * i as f64, 0.0, 0.0),
                    Vector3::x(),
                    Vector3::z(),
                ),
                half_width: 20.0,
                half_length: 30.0,
                disabled: false,
            })
            .collect();
        let mut scope = Self {
            road,
            index: MeasurementIndex::new(),
            next_id: 1000,
        };
        for (i, x) in hits.iter().enumerate() {
            if let Some(x) = x {
                scope.insert(i as u64 + 1, i, *x);
            }
        }
        scope
    }

    /// Another hit on `module`; returns its id.
    pub fn add_hit(&mut self, module: usize, x: f64) -> MeasurementId {
        self.next_id += 1;
        self.insert(self.next_id, module, x)
    }

    fn insert(&mut self, id: u64, module: usize, x: f64) -> MeasurementId {
        let id = MeasurementId(id);
        self.index.insert(Measurement::pixel(
            id,
            ElementId(module as u64),
            Vector2::new(x, 0.0),
            0.01,
            0.05,
        ));
        id
    }

    pub fn tools(&self) -> Tools {
        Tools::for_field(0.0, 0.1)
    }

    pub fn config(&self) -> FinderConfig {
        FinderConfig::default()
    }

    pub fn context<'t>(&self, tools: &'t Tools, config: &'t FinderConfig) -> SearchContext<'t> {
        SearchContext::new(tools, config)
    }

    pub fn links(&self) -> Vec<BoundaryLink<'_>> {
        self.road.iter().map(|e| BoundaryLink::new(e, 0.1)).collect()
    }

    /// Parameters of the true track on the first module.
    pub fn seed(&self) -> PatternParameters {
        PatternParameters::new(
            self.road[0].surface,
            LocalVec::new(0.0, 0.0, 0.0, FRAC_PI_2, 1e-4),
            None,
        )
    }

    /// The first hit of each listed module.
    pub fn seed_hits(&self, modules: &[usize]) -> Vec<&Measurement> {
        modules
            .iter()
            .filter_map(|&i| self.index.on_element(ElementId(i as u64)).first())
            .collect()
    }
}
