//! Integration tests for the synthetic session on the headless device.

use std::sync::Arc;

use frameslot_core::SessionSettings;
use frameslot_resources::FsAssetLoader;
use frameslot_rhi::headless::HeadlessDevice;
use frameslot_rhi::Extent2D;
use frameslot_session::{ArFrame, ArSession, DisplayRotation, SessionError, SyntheticSession};

const FULL: [[f32; 2]; 4] = [[0.0, 0.0], [0.0, 1.0], [1.0, 0.0], [1.0, 1.0]];

#[test]
fn test_backdrop_is_uploaded_to_camera_texture() {
    let dir = tempfile::tempdir().unwrap();
    image::RgbaImage::from_pixel(6, 4, image::Rgba([9, 8, 7, 255]))
        .save(dir.path().join("room.png"))
        .unwrap();

    let device = Arc::new(HeadlessDevice::new());
    let settings = SessionSettings {
        backdrop: Some("room.png".into()),
        ..SessionSettings::default()
    };
    let mut session =
        SyntheticSession::new(device.clone(), &settings, &FsAssetLoader::new(dir.path())).unwrap();

    let frame = session.update().unwrap();
    assert_eq!(frame.camera_extent(), Extent2D::new(6, 4));
    assert!(frame.display_geometry_changed());

    device.flush();
    let pixels = device.read_texture(frame.camera_texture()).unwrap();
    assert!(pixels.chunks_exact(4).all(|p| p == [9, 8, 7, 255]));
}

#[test]
fn test_missing_backdrop_fails_session_creation() {
    let dir = tempfile::tempdir().unwrap();
    let device = Arc::new(HeadlessDevice::new());
    let settings = SessionSettings {
        backdrop: Some("absent.png".into()),
        ..SessionSettings::default()
    };

    let result = SyntheticSession::new(device, &settings, &FsAssetLoader::new(dir.path()));
    assert!(matches!(result, Err(SessionError::Backdrop(_))));
}

#[test]
fn test_configured_rotation_applies_to_first_frame() {
    let device = Arc::new(HeadlessDevice::new());
    let settings = SessionSettings {
        width: 32,
        height: 16,
        rotation: 270,
        backdrop: None,
    };
    let mut session =
        SyntheticSession::new(device, &settings, &FsAssetLoader::default()).unwrap();

    assert_eq!(session.display_extent(), Extent2D::new(16, 32));
    let frame = session.update().unwrap();
    assert_eq!(frame.rotation(), DisplayRotation::Deg270);
    assert_eq!(
        frame.transform_uv(&FULL),
        [[1.0, 0.0], [0.0, 0.0], [1.0, 1.0], [0.0, 1.0]]
    );
}

#[test]
fn test_frames_advance_time_and_pose() {
    let device = Arc::new(HeadlessDevice::new());
    let mut session = SyntheticSession::with_pattern(device, Extent2D::new(8, 8)).unwrap();

    let first = session.update().unwrap();
    let second = session.update().unwrap();

    assert_eq!(first.timestamp(), 0);
    assert!(second.timestamp() > first.timestamp());
    assert_ne!(first.camera_pose(), second.camera_pose());
    assert_eq!(first.camera_pose().w_axis.y, 1.5);
    assert_eq!(session.frame_number(), 2);
}

#[test]
fn test_pattern_changes_camera_image() {
    let device = Arc::new(HeadlessDevice::new());
    let mut session = SyntheticSession::with_pattern(device.clone(), Extent2D::new(16, 8)).unwrap();

    let texture = session.update().unwrap().camera_texture();
    device.flush();
    let first = device.read_texture(texture).unwrap();

    session.update().unwrap();
    device.flush();
    let second = device.read_texture(texture).unwrap();

    assert_ne!(first, second);
}
