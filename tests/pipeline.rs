mod common;

use common::synthetic_scene::{
    cube_edges, find_matching_segment, intrinsics, look_at_origin, project, ring_views,
    SyntheticView, IMAGE_SIZE,
};
use line3d_recon::{
    EngineOptions, LineReconstructor, MatchingParams, ReconstructionParams, Segment3D,
};
use nalgebra::Vector3;
use std::collections::HashSet;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn register_with_worldpoints(engine: &LineReconstructor, views: &[SyntheticView]) {
    // All cube corners are shared tie-points of every view.
    let ties: Vec<u32> = (0..8).collect();
    for view in views {
        engine
            .add_image(
                view.cam_id,
                intrinsics(),
                view.r,
                view.t,
                IMAGE_SIZE,
                IMAGE_SIZE,
                5.0,
                &ties,
                view.segments.clone(),
            )
            .expect("register view");
    }
}

fn cube_matching_params() -> MatchingParams {
    MatchingParams {
        sigma_p: 1.0,
        sigma_a: 5.0,
        num_neighbors: 5,
        epipolar_overlap: 0.5,
        min_baseline: 0.1,
        knn: 0,
    }
}

fn cube_engine() -> LineReconstructor {
    let engine = LineReconstructor::new(EngineOptions::default());
    register_with_worldpoints(&engine, &ring_views(6, 5.0, &cube_edges()));
    engine
}

#[test]
fn cube_reconstruction_recovers_all_edges() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&cube_matching_params());
    // Every segment of every view ends up with a 3D estimate.
    assert_eq!(engine.num_estimates(), 6 * 12);

    engine.reconstruct(&ReconstructionParams::default());
    let lines = engine.lines();
    assert_eq!(lines.len(), 12, "expected one line per cube edge");

    let edges = cube_edges();
    let mut recovered = HashSet::new();
    for line in lines {
        assert!(
            line.cluster
                .members
                .iter()
                .map(|m| m.cam)
                .collect::<HashSet<_>>()
                .len()
                >= 3
        );
        assert_eq!(line.segments.len(), 1, "one collinear interval per edge");
        let interval = &line.segments[0];
        let edge = find_matching_segment(&interval.p1, &interval.p2, &edges, 1e-3)
            .expect("interval matches a true cube edge");
        recovered.insert(edge);
    }
    assert_eq!(recovered.len(), 12);
}

#[test]
fn two_camera_rig_matches_but_reconstructs_nothing() {
    init_logging();
    let all = ring_views(6, 5.0, &cube_edges());
    // Opposing cameras, wired as explicit visual neighbors of each other.
    let views = [all[0].clone(), all[3].clone()];

    let engine = LineReconstructor::new(EngineOptions {
        neighbors_by_worldpoints: false,
        ..EngineOptions::default()
    });
    for view in &views {
        let neighbor = if view.cam_id == 0 { 3 } else { 0 };
        engine
            .add_image(
                view.cam_id,
                intrinsics(),
                view.r,
                view.t,
                IMAGE_SIZE,
                IMAGE_SIZE,
                5.0,
                &[neighbor],
                view.segments.clone(),
            )
            .expect("register view");
    }

    let mut engine = engine;
    engine.match_segments(&MatchingParams {
        knn: 1,
        ..cube_matching_params()
    });
    assert!(engine.num_candidate_matches() > 0, "pairwise matching finds candidates");
    // A single target view cannot provide cross-view support.
    assert_eq!(engine.num_estimates(), 0);

    engine.reconstruct(&ReconstructionParams::default());
    assert!(engine.lines().is_empty());
}

#[test]
fn duplicate_camera_id_is_rejected() {
    init_logging();
    let views = ring_views(6, 5.0, &cube_edges());
    let engine = LineReconstructor::new(EngineOptions::default());
    let ties: Vec<u32> = (0..8).collect();

    let add = |view: &SyntheticView| {
        engine.add_image(
            7,
            intrinsics(),
            view.r,
            view.t,
            IMAGE_SIZE,
            IMAGE_SIZE,
            5.0,
            &ties,
            view.segments.clone(),
        )
    };
    assert!(add(&views[0]).is_ok());
    assert!(add(&views[1]).is_err());
    assert_eq!(engine.num_views(), 1);
}

#[test]
fn fixed_world_regularizer_reconstructs_and_tags_filename() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&MatchingParams {
        sigma_p: -0.01,
        ..cube_matching_params()
    });
    engine.reconstruct(&ReconstructionParams::default());

    assert_eq!(engine.lines().len(), 12);
    let name = engine.result_filename();
    assert!(name.contains("__FXD_SIGMA_P__"), "filename was {name}");
    assert!(name.contains("__sigmaP_0.01__"), "filename was {name}");
}

#[test]
fn filename_reflects_effective_parameters() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&cube_matching_params());
    engine.reconstruct(&ReconstructionParams::default());
    assert_eq!(
        engine.result_filename(),
        "Line3D++__W_2048__N_5__sigmaP_1__sigmaA_5__epiOverlap_0.5__minBaseline_0.1__vis_3"
    );
}

// A single vertical 3D line observed as two overlapping collinear pieces in
// every view.
fn split_line_views() -> Vec<SyntheticView> {
    let sub0 = (Vector3::new(0.0, -0.5, 0.0), Vector3::new(0.0, 0.05, 0.0));
    let sub1 = (Vector3::new(0.0, -0.05, 0.0), Vector3::new(0.0, 0.5, 0.0));
    ring_views(6, 5.0, &[sub0, sub1])
}

#[test]
fn collinear_pieces_merge_into_one_line() {
    init_logging();
    let engine = LineReconstructor::new(EngineOptions::default());
    register_with_worldpoints(&engine, &split_line_views());
    let mut engine = engine;

    engine.match_segments(&MatchingParams {
        epipolar_overlap: 0.25,
        ..cube_matching_params()
    });
    engine.reconstruct(&ReconstructionParams {
        collinearity_t: 2.0,
        ..ReconstructionParams::default()
    });

    let lines = engine.lines();
    assert_eq!(lines.len(), 1, "collinear pieces should merge");
    assert_eq!(lines[0].cluster.members.len(), 12);
    assert_eq!(lines[0].segments.len(), 1);
    // The single interval spans both pieces.
    assert!(lines[0].segments[0].length() > 0.9);
}

#[test]
fn collinearity_zero_keeps_pieces_apart() {
    init_logging();
    let engine = LineReconstructor::new(EngineOptions::default());
    register_with_worldpoints(&engine, &split_line_views());
    let mut engine = engine;

    engine.match_segments(&MatchingParams {
        epipolar_overlap: 0.25,
        ..cube_matching_params()
    });
    engine.reconstruct(&ReconstructionParams {
        collinearity_t: 0.0,
        ..ReconstructionParams::default()
    });
    assert_eq!(engine.lines().len(), 2);
}

// Five parallel vertical 3D lines a few pixels apart, progressively
// shortened so the kNN ranking by overlap is unambiguous. The source view
// observes only the first line; both helper views observe all five. The
// extra lines pass the epipolar-overlap gate, but their two-way
// triangulations disagree between the helper views, so only the true
// correspondences collect cross-view support.
fn parallel_line_views() -> Vec<SyntheticView> {
    let k = intrinsics();
    let lines: Vec<(Vector3<f64>, Vector3<f64>)> = (0..5)
        .map(|i| {
            let x = 0.04 * f64::from(i);
            (
                Vector3::new(x, -0.5, 0.0),
                Vector3::new(x, 0.5 - 0.05 * f64::from(i), 0.0),
            )
        })
        .collect();

    let build = |cam_id: u32, angle_deg: f64, observed: &[(Vector3<f64>, Vector3<f64>)]| {
        let angle = angle_deg.to_radians();
        let center = Vector3::new(5.0 * angle.sin(), 0.0, -5.0 * angle.cos());
        let (r, t) = look_at_origin(center);
        let segments = observed
            .iter()
            .map(|(p1, p2)| {
                let a = project(&k, &r, &t, p1);
                let b = project(&k, &r, &t, p2);
                [a[0], a[1], b[0], b[1]]
            })
            .collect();
        SyntheticView {
            cam_id,
            r,
            t,
            segments,
        }
    };

    // The source view registers first so its kNN cap applies to the fresh
    // pairwise candidates.
    vec![
        build(10, 0.0, &lines[..1]),
        build(11, 60.0, &lines),
        build(12, -60.0, &lines),
    ]
}

#[test]
fn knn_cap_composes_with_score_filtering() {
    init_logging();
    let views = parallel_line_views();

    let run = |knn: i32| {
        let engine = LineReconstructor::new(EngineOptions {
            neighbors_by_worldpoints: false,
            ..EngineOptions::default()
        });
        for view in &views {
            let neighbors: &[u32] = if view.cam_id == 10 { &[11, 12] } else { &[10] };
            engine
                .add_image(
                    view.cam_id,
                    intrinsics(),
                    view.r,
                    view.t,
                    IMAGE_SIZE,
                    IMAGE_SIZE,
                    5.0,
                    neighbors,
                    view.segments.clone(),
                )
                .expect("register view");
        }
        let mut engine = engine;
        engine.match_segments(&MatchingParams {
            epipolar_overlap: 0.25,
            knn,
            ..cube_matching_params()
        });
        engine
    };

    // Only the two true correspondences (one per helper view) are supported
    // across both helpers.
    let supported = 2usize;

    // Uncapped: the source segment gathers all ten passing candidates, five
    // per helper view; scoring prunes them to the supported pair.
    let uncapped = run(0);
    assert_eq!(uncapped.num_candidate_matches(), 10);
    assert_eq!(uncapped.num_matches(), supported);
    assert_eq!(uncapped.num_estimates(), 1);

    // knn = 3 keeps the three best-overlapping candidates per helper view;
    // the score filter then leaves exactly min(3, #supported) matches.
    let capped = run(3);
    assert_eq!(capped.num_candidate_matches(), 6);
    assert_eq!(capped.num_matches(), supported.min(3));
}

#[test]
fn visibility_above_camera_count_yields_no_lines() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&cube_matching_params());
    engine.reconstruct(&ReconstructionParams {
        visibility_t: 10,
        ..ReconstructionParams::default()
    });
    assert!(engine.lines().is_empty());
}

fn line_endpoints(engine: &LineReconstructor) -> Vec<(Vector3<f64>, Vector3<f64>)> {
    engine
        .lines()
        .iter()
        .flat_map(|line| line.segments.iter().map(|s| (s.p1, s.p2)))
        .collect()
}

#[test]
fn matching_twice_is_idempotent() {
    init_logging();
    let mut engine = cube_engine();
    let params = cube_matching_params();

    engine.match_segments(&params);
    let first_matches = engine.num_matches();
    let first_estimates = engine.num_estimates();
    engine.reconstruct(&ReconstructionParams::default());
    let first_lines = line_endpoints(&engine);

    engine.match_segments(&params);
    assert_eq!(engine.num_matches(), first_matches);
    assert_eq!(engine.num_estimates(), first_estimates);
    engine.reconstruct(&ReconstructionParams::default());
    let second_lines = line_endpoints(&engine);

    assert_eq!(first_lines.len(), second_lines.len());
    for ((a1, a2), (b1, b2)) in first_lines.iter().zip(&second_lines) {
        assert!((a1 - b1).norm() < 1e-9);
        assert!((a2 - b2).norm() < 1e-9);
    }
}

#[test]
fn reconstructing_twice_is_idempotent() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&cube_matching_params());

    engine.reconstruct(&ReconstructionParams::default());
    let first = line_endpoints(&engine);
    engine.reconstruct(&ReconstructionParams::default());
    let second = line_endpoints(&engine);

    assert_eq!(first.len(), second.len());
    for ((a1, a2), (b1, b2)) in first.iter().zip(&second) {
        assert!((a1 - b1).norm() < 1e-9);
        assert!((a2 - b2).norm() < 1e-9);
    }
}

#[test]
fn obj_export_roundtrips() {
    init_logging();
    let mut engine = cube_engine();
    engine.match_segments(&cube_matching_params());
    engine.reconstruct(&ReconstructionParams::default());

    let dir = std::env::temp_dir().join(format!("line3d_recon_obj_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = engine.write_obj(&dir).expect("write obj");
    let first = std::fs::read_to_string(&path).unwrap();

    // Parse the OBJ back into segments and re-export.
    let mut vertices: Vec<Vector3<f64>> = Vec::new();
    let mut segments: Vec<Segment3D> = Vec::new();
    for obj_line in first.lines() {
        let tokens: Vec<&str> = obj_line.split_whitespace().collect();
        match tokens[0] {
            "v" => vertices.push(Vector3::new(
                tokens[1].parse().unwrap(),
                tokens[2].parse().unwrap(),
                tokens[3].parse().unwrap(),
            )),
            "l" => {
                let i: usize = tokens[1].parse().unwrap();
                let j: usize = tokens[2].parse().unwrap();
                segments.push(Segment3D::new(vertices[i - 1], vertices[j - 1]));
            }
            _ => panic!("unexpected OBJ record {obj_line}"),
        }
    }
    let collection = vec![line3d_recon::FinalLine3D {
        cluster: line3d_recon::LineCluster3D {
            line: segments[0],
            reference: line3d_recon::Segment2D::new(line3d_recon::CameraId(0), 0),
            members: Vec::new(),
        },
        segments,
    }];
    let second_path = dir.join("roundtrip.obj");
    line3d_recon::io::write_obj(&collection, &second_path).unwrap();
    let second = std::fs::read_to_string(&second_path).unwrap();
    assert_eq!(first, second);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn fundamental_cache_symmetry() {
    // F(a, b) and F(b, a)ᵀ describe the same epipolar constraint.
    let views = ring_views(3, 5.0, &cube_edges());
    let k = intrinsics();
    let f_ab = line3d_recon::geometry::fundamental_from_poses(
        &k,
        &views[0].r,
        &views[0].t,
        &k,
        &views[1].r,
        &views[1].t,
    );
    let f_ba = line3d_recon::geometry::fundamental_from_poses(
        &k,
        &views[1].r,
        &views[1].t,
        &k,
        &views[0].r,
        &views[0].t,
    );
    assert!((f_ab - f_ba.transpose()).norm() < 1e-9);
}

#[test]
fn registration_is_thread_safe() {
    use std::sync::Arc;

    init_logging();
    let views = ring_views(6, 5.0, &cube_edges());
    let engine = Arc::new(LineReconstructor::new(EngineOptions::default()));
    let ties: Vec<u32> = (0..8).collect();

    let handles: Vec<_> = views
        .into_iter()
        .map(|view| {
            let engine = Arc::clone(&engine);
            let ties = ties.clone();
            std::thread::spawn(move || {
                engine
                    .add_image(
                        view.cam_id,
                        intrinsics(),
                        view.r,
                        view.t,
                        IMAGE_SIZE,
                        IMAGE_SIZE,
                        5.0,
                        &ties,
                        view.segments,
                    )
                    .is_ok()
            })
        })
        .collect();
    let admitted = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|ok| *ok)
        .count();
    assert_eq!(admitted, 6);

    let mut engine = Arc::into_inner(engine).expect("sole owner");
    engine.match_segments(&cube_matching_params());
    engine.reconstruct(&ReconstructionParams::default());
    assert_eq!(engine.lines().len(), 12);
}
