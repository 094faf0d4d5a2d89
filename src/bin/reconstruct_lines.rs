use line3d_recon::{EngineOptions, LineReconstructor, MatchingParams, ReconstructionParams};
use nalgebra::{Matrix3, Vector3};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
struct SceneConfig {
    #[serde(default)]
    engine: EngineOptions,
    #[serde(default)]
    matching: MatchingParams,
    #[serde(default)]
    reconstruction: ReconstructionParams,
    /// Output directory; defaults to the scene file's directory.
    output_dir: Option<PathBuf>,
    views: Vec<ViewConfig>,
}

#[derive(Debug, Deserialize)]
struct ViewConfig {
    cam_id: u32,
    k: [[f64; 3]; 3],
    /// Row-major rotation matrix; alternatively `rpy` in radians.
    r: Option<[[f64; 3]; 3]>,
    rpy: Option<[f64; 3]>,
    t: [f64; 3],
    width: u32,
    height: u32,
    median_depth: f64,
    /// Tie-point ids or explicit neighbor camera ids, per
    /// `engine.neighbors_by_worldpoints`.
    ties: Vec<u32>,
    segments: Vec<[f64; 4]>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let scene_path = env::args().nth(1).ok_or_else(usage)?;
    let scene_path = Path::new(&scene_path);
    let config = load_scene(scene_path)?;

    let output_dir = config
        .output_dir
        .clone()
        .unwrap_or_else(|| scene_path.parent().unwrap_or(Path::new(".")).to_path_buf());
    fs::create_dir_all(&output_dir)
        .map_err(|e| format!("Failed to create {}: {e}", output_dir.display()))?;

    let engine = LineReconstructor::new(config.engine);
    for view in &config.views {
        let r = rotation_of(view)?;
        if let Err(err) = engine.add_image(
            view.cam_id,
            matrix_of(&view.k),
            r,
            Vector3::new(view.t[0], view.t[1], view.t[2]),
            view.width,
            view.height,
            view.median_depth,
            &view.ties,
            view.segments.clone(),
        ) {
            eprintln!("Skipping view {}: {err}", view.cam_id);
        }
    }

    let mut engine = engine;
    engine.match_segments(&config.matching);
    engine.reconstruct(&config.reconstruction);

    println!(
        "views={} matches={} estimates={} lines={}",
        engine.num_views(),
        engine.num_matches(),
        engine.num_estimates(),
        engine.lines().len()
    );

    if engine.lines().is_empty() {
        println!("No 3D lines reconstructed; nothing written.");
        return Ok(());
    }

    for result in [
        engine.write_stl(&output_dir),
        engine.write_obj(&output_dir),
        engine.write_txt(&output_dir),
    ] {
        let path = result.map_err(|e| format!("Failed to write output: {e}"))?;
        println!("wrote {}", path.display());
    }
    Ok(())
}

fn load_scene(path: &Path) -> Result<SceneConfig, String> {
    let data = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read scene {}: {e}", path.display()))?;
    serde_json::from_str(&data)
        .map_err(|e| format!("Failed to parse scene {}: {e}", path.display()))
}

fn rotation_of(view: &ViewConfig) -> Result<Matrix3<f64>, String> {
    match (&view.r, &view.rpy) {
        (Some(rows), _) => Ok(matrix_of(rows)),
        (None, Some([roll, pitch, yaw])) => {
            Ok(line3d_recon::geometry::rotation_from_rpy(*roll, *pitch, *yaw))
        }
        (None, None) => Err(format!(
            "view {} needs either \"r\" or \"rpy\"",
            view.cam_id
        )),
    }
}

fn matrix_of(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::new(
        rows[0][0], rows[0][1], rows[0][2], rows[1][0], rows[1][1], rows[1][2], rows[2][0],
        rows[2][1], rows[2][2],
    )
}

fn usage() -> String {
    "Usage: reconstruct_lines <scene.json>".to_string()
}
