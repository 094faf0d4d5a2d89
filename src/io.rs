//! Output writers for the reconstructed 3D lines.
//!
//! Three formats are supported: ASCII STL (one degenerate facet per 3D
//! segment), Wavefront OBJ (`v`/`l` records), and a plain-text format that
//! also carries the 2D residuals of every line.

use crate::types::{FinalLine3D, Segment2D};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

/// Failures of the output writers.
#[derive(Debug, Error)]
pub enum OutputError {
    /// There is nothing to write.
    #[error("no 3D lines to save")]
    NoLines,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// ASCII STL: every collinear 3D segment becomes one degenerate facet with a
/// constant normal.
pub fn write_stl(lines: &[FinalLine3D], path: &Path) -> Result<(), OutputError> {
    let mut file = BufWriter::new(File::create(path)?);
    writeln!(file, "solid lineModel")?;
    for line in lines {
        for seg in &line.segments {
            writeln!(file, " facet normal 1.0e+00 0.0e+00 0.0e+00")?;
            writeln!(file, "  outer loop")?;
            writeln!(file, "   vertex {:e} {:e} {:e}", seg.p1.x, seg.p1.y, seg.p1.z)?;
            writeln!(file, "   vertex {:e} {:e} {:e}", seg.p2.x, seg.p2.y, seg.p2.z)?;
            writeln!(file, "   vertex {:e} {:e} {:e}", seg.p1.x, seg.p1.y, seg.p1.z)?;
            writeln!(file, "  endloop")?;
            writeln!(file, " endfacet")?;
        }
    }
    writeln!(file, "endsolid lineModel")?;
    Ok(())
}

/// Wavefront OBJ: one `v` record per endpoint in traversal order, then an
/// `l` record per segment with 1-based indices.
pub fn write_obj(lines: &[FinalLine3D], path: &Path) -> Result<(), OutputError> {
    let mut file = BufWriter::new(File::create(path)?);
    let mut num_segments = 0usize;
    for line in lines {
        for seg in &line.segments {
            writeln!(file, "v {} {} {}", seg.p1.x, seg.p1.y, seg.p1.z)?;
            writeln!(file, "v {} {} {}", seg.p2.x, seg.p2.y, seg.p2.z)?;
            num_segments += 1;
        }
    }
    for i in 0..num_segments {
        writeln!(file, "l {} {}", 2 * i + 1, 2 * i + 2)?;
    }
    Ok(())
}

/// Plain text, one final line per row: the count of collinear 3D intervals
/// and their endpoints, then the count of 2D residuals and per residual
/// `cam seg x1 y1 x2 y2`.
pub fn write_txt<F>(lines: &[FinalLine3D], resolve: &F, path: &Path) -> Result<(), OutputError>
where
    F: Fn(Segment2D) -> [f64; 4],
{
    let mut file = BufWriter::new(File::create(path)?);
    for line in lines {
        if line.segments.is_empty() {
            continue;
        }
        let mut tokens: Vec<String> = Vec::new();
        tokens.push(line.segments.len().to_string());
        for seg in &line.segments {
            for value in [seg.p1.x, seg.p1.y, seg.p1.z, seg.p2.x, seg.p2.y, seg.p2.z] {
                tokens.push(value.to_string());
            }
        }
        tokens.push(line.cluster.members.len().to_string());
        for &member in &line.cluster.members {
            tokens.push(member.cam.to_string());
            tokens.push(member.seg.to_string());
            for value in resolve(member) {
                tokens.push(value.to_string());
            }
        }
        writeln!(file, "{}", tokens.join(" "))?;
    }
    Ok(())
}
