use std::sync::Arc;

use common::{Buffer2, FloatExt};

use super::*;
use crate::config::Config;
use crate::coordinates::AffineCoordinates;
use crate::entity::{Entity, EntityFactory, Source};
use crate::error::Error;
use crate::plugins::detection::{DetectionFrame, PixelCoordinate};
use crate::plugins::flags::{BoundaryFlag, SaturateFlag};
use crate::task::TaskResolver;
use crate::tile::{MemorySource, TileStore, TileStoreConfig, TiledImage};

fn frame(label: &str, pixels: Buffer2<f32>) -> Frame {
    let store = TileStore::new(TileStoreConfig {
        tile_width: 4,
        tile_height: 4,
        ..TileStoreConfig::default()
    });
    let id = store.register(Arc::new(MemorySource::from_buffer(label, pixels)));
    Frame::new(TiledImage::new(store, id).unwrap())
}

/// 8x8 image, zero except for the given pixels.
fn image(values: &[((usize, usize), f32)]) -> Buffer2<f32> {
    let mut pixels = Buffer2::new_default(8, 8);
    for &((x, y), v) in values {
        *pixels.get_mut(x, y) = v;
    }
    pixels
}

fn factory_with(measurement_frames: Vec<Arc<Frame>>, config: &Config) -> Arc<EntityFactory> {
    let mut registry = TaskFactoryRegistry::new();
    register_default_plugins(&mut registry, measurement_frames).unwrap();
    registry.configure(config).unwrap();
    EntityFactory::new(TaskResolver::new(registry))
}

fn detected(factory: &EntityFactory, frame: &Arc<Frame>, pixels: &[(i64, i64)]) -> Source {
    let mut source = factory.create_source();
    source.set_property(DetectionFrame {
        frame: frame.clone(),
    });
    source.set_property(PixelCoordinateList::new(
        pixels
            .iter()
            .map(|&(x, y)| PixelCoordinate::new(x, y))
            .collect(),
    ));
    source
}

#[test]
fn pixel_measurements() {
    let detection = Arc::new(frame("det", image(&[((2, 3), 1.0), ((3, 3), 3.0)])));
    let config =
        Config::from_yaml_str("plugins: {photometry: {magnitude_zero_point: 25.0}}").unwrap();
    let factory = factory_with(Vec::new(), &config);
    let mut source = detected(&factory, &detection, &[(2, 3), (3, 3)]);

    let bounds = source.get_property::<PixelBoundaries>().unwrap();
    assert_eq!(
        *bounds,
        PixelBoundaries {
            min_x: 2,
            min_y: 3,
            max_x: 3,
            max_y: 3
        }
    );
    assert_eq!(bounds.width(), 2);

    let flux = source.get_property::<IsophotalFlux>().unwrap();
    assert!(flux.flux.approximately_eq(4.0));
    assert!(flux.magnitude.approximately_eq(25.0 - 2.5 * 4f64.log10()));

    let centroid = source.get_property::<PixelCentroid>().unwrap();
    assert!(centroid.x.approximately_eq(2.75));
    assert!(centroid.y.approximately_eq(3.0));

    assert_eq!(source.get_property::<PeakValue>().unwrap().value, 3.0);
}

#[test]
fn non_positive_flux_is_a_recoverable_measurement_error() {
    let detection = Arc::new(frame("det", image(&[])).with_background(2.0));
    let factory = factory_with(Vec::new(), &Config::default());
    let mut source = detected(&factory, &detection, &[(1, 1), (1, 2)]);

    let err = source.get_property::<PixelCentroid>().unwrap_err();
    assert!(matches!(err, Error::Measurement { property: "PixelCentroid", .. }));
    assert!(err.is_recoverable());

    let flux = source.get_property::<IsophotalFlux>().unwrap();
    assert_eq!(flux.magnitude, pixel::MAGNITUDE_SENTINEL);
}

#[test]
fn saturation_and_boundary_flags() {
    let detection = Arc::new(
        frame("det", image(&[((0, 4), 12.0), ((5, 5), 3.0)])).with_saturation(10.0),
    );
    let factory = factory_with(Vec::new(), &Config::default());

    let mut edge = detected(&factory, &detection, &[(0, 4)]);
    assert!(edge.get_property::<SaturateFlag>().unwrap().0);
    assert!(edge.get_property::<BoundaryFlag>().unwrap().0);
    let flags = edge.get_property::<SourceFlags>().unwrap();
    assert!(flags.contains(SourceFlags::SATURATED | SourceFlags::BOUNDARY));
    assert!(!flags.contains(SourceFlags::BAD_PROJECTION));

    let mut inner = detected(&factory, &detection, &[(5, 5)]);
    assert_eq!(inner.get_property::<SourceFlags>().unwrap().bits, 0);
}

#[test]
fn rectangle_is_projected_and_clipped_per_frame() {
    let detection = Arc::new(frame("det", image(&[((3, 1), 5.0), ((4, 2), 5.0)])));
    let shifted = Arc::new(
        frame("shifted", image(&[])).with_coordinates(Arc::new(AffineCoordinates::offset(2.0, 0.0))),
    );
    let far = Arc::new(
        frame("far", image(&[])).with_coordinates(Arc::new(AffineCoordinates::offset(-20.0, 0.0))),
    );
    let factory = factory_with(vec![shifted, far], &Config::default());
    let mut source = detected(&factory, &detection, &[(3, 1), (4, 2)]);

    let rect = source
        .get_indexed_property::<MeasurementFrameRectangle>(0)
        .unwrap();
    assert_eq!((rect.min_x, rect.min_y, rect.max_x, rect.max_y), (1, 1, 2, 2));
    assert!(!rect.bad_projection);

    let missed = source
        .get_indexed_property::<MeasurementFrameRectangle>(1)
        .unwrap();
    assert_eq!(*missed, MeasurementFrameRectangle::OFF_FRAME);
    assert!(missed.is_empty());
    assert!(!missed.bad_projection);

    // missing a frame is not a failed transform
    let flags = source.get_property::<SourceFlags>().unwrap();
    assert!(!flags.contains(SourceFlags::BAD_PROJECTION));

    // only two frames were registered
    assert!(matches!(
        source.get_indexed_property::<MeasurementFrameRectangle>(2),
        Err(Error::UnknownProperty { instance: 2, .. })
    ));
}

#[test]
fn invalid_projection_yields_sentinel() {
    let detection = Arc::new(frame("det", image(&[((3, 3), 5.0)])));
    let limited = AffineCoordinates::offset(0.0, 0.0).with_valid_region(
        crate::coordinates::WorldCoordinate::new(-1.0, -1.0),
        crate::coordinates::WorldCoordinate::new(2.0, 2.0),
    );
    let measured = Arc::new(frame("limited", image(&[])).with_coordinates(Arc::new(limited)));
    let factory = factory_with(vec![measured], &Config::default());
    let mut source = detected(&factory, &detection, &[(3, 3)]);

    let rect = source
        .get_indexed_property::<MeasurementFrameRectangle>(0)
        .unwrap();
    assert!(rect.bad_projection);
    assert!(rect.is_empty());
    assert!(source.get_property::<SourceFlags>().unwrap().contains(SourceFlags::BAD_PROJECTION));
    assert!(source.failures().is_empty());
}

#[test]
fn group_boundaries_cover_all_members() {
    let detection = Arc::new(frame("det", image(&[])));
    let factory = factory_with(Vec::new(), &Config::default());
    let mut group = factory.create_group();
    group.add_source(detected(&factory, &detection, &[(1, 1), (2, 1)]));
    group.add_source(detected(&factory, &detection, &[(5, 4)]));

    let bounds = group.get_property::<GroupBoundaries>().unwrap();
    assert_eq!(
        bounds.0,
        PixelBoundaries {
            min_x: 1,
            min_y: 1,
            max_x: 5,
            max_y: 4
        }
    );
}

#[test]
fn default_columns_cover_every_frame() {
    let mut outputs = OutputRegistry::new();
    register_default_columns(&mut outputs, 2).unwrap();
    let names = outputs.column_names();
    assert_eq!(names[0], "SOURCE_ID");
    assert!(names.contains(&"FLUX_ISO"));
    assert!(names.contains(&"XMIN_FRAME_1"));
    assert!(names.contains(&"YMAX_FRAME_2"));
    assert!(!names.contains(&"XMIN_FRAME_3"));
}

#[test]
fn photometry_section_is_claimed() {
    let mut registry = TaskFactoryRegistry::new();
    register_default_plugins(&mut registry, Vec::new()).unwrap();
    assert!(registry.config_dependencies().contains(pixel::PHOTOMETRY_SECTION));

    let config = Config::from_yaml_str("plugins: {psf: {}}").unwrap();
    assert!(matches!(
        registry.configure(&config),
        Err(Error::UnknownConfigSection(_))
    ));
}
