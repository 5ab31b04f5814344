use anyhow::{Context, Result};
use clap::Parser;
use dashmap::DashMap;
use env_logger::Builder;
use image::{ImageBuffer, Rgba, RgbaImage};
use imageproc::drawing::draw_filled_circle_mut;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn, LevelFilter};
use minimp4::Mp4Muxer;
use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVBuffer;
use orion_common::io::load_trajectory;
use orion_common::{Snapshot, Trajectory};
use palette::{FromColor, Hsv, Srgb};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Instant;

/// Renders an Orion trajectory to an MP4 video
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Trajectory file (json, bin, msgpack or f64)
    #[arg(short, long)]
    input: PathBuf,

    /// Output video file path (.mp4)
    #[arg(short, long, default_value = "orion_video.mp4")]
    output: PathBuf,

    /// Also write the last frame as a PNG image
    #[arg(long)]
    final_png: Option<PathBuf>,

    /// Width of the output video in pixels
    #[arg(long, default_value_t = 1024)]
    width: u32,

    /// Height of the output video in pixels (square if not provided)
    #[arg(long)]
    height: Option<u32>,

    /// Frames per second for the output video
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// Half-width of the view around the centre of the data, in the trajectory's length unit.
    /// Fitted to the x/y extent of all snapshots if not provided.
    #[arg(long)]
    extent: Option<f64>,

    /// Radius in pixels of the lightest body
    #[arg(long, default_value_t = 1.0)]
    min_radius: f32,

    /// Radius in pixels of the heaviest body
    #[arg(long, default_value_t = 8.0)]
    max_radius: f32,

    /// Body color - use "palette" for a distinct color per body, or a specific color name
    /// (black, white, red, green, blue, yellow, cyan, magenta)
    #[arg(long, default_value = "palette")]
    color: String,

    /// Background color name
    #[arg(long, default_value = "black")]
    bg_color: String,

    /// Snapshots per parallel rendering chunk
    #[arg(long, default_value_t = 10)]
    chunk_size: usize,
}

const COLOR_MAP: &[(&str, [u8; 4])] = &[
    ("black", [0, 0, 0, 255]),
    ("white", [255, 255, 255, 255]),
    ("red", [255, 0, 0, 255]),
    ("green", [0, 255, 0, 255]),
    ("blue", [0, 0, 255, 255]),
    ("yellow", [255, 255, 0, 255]),
    ("cyan", [0, 255, 255, 255]),
    ("magenta", [255, 0, 255, 255]),
];

fn parse_color(color_name: &str) -> [u8; 4] {
    for &(name, color) in COLOR_MAP {
        if name.eq_ignore_ascii_case(color_name) {
            return color;
        }
    }
    warn!("Color '{}' not recognized, using white.", color_name);
    [255, 255, 255, 255]
}

/// One color per body, spread around the hue circle and shuffled so neighbours in index differ.
fn generate_color_palette(count: usize) -> Vec<[u8; 4]> {
    let mut rng = rand::rng();
    let mut colors: Vec<[u8; 4]> = (0..count)
        .map(|i| {
            let hue = i as f32 / count as f32 * 360.0;
            let hsv = Hsv::new(hue, 0.6 + rng.random_range(-0.1..0.1), 0.9 + rng.random_range(-0.1..0.1));
            let rgb = Srgb::from_color(hsv);
            [(rgb.red * 255.0) as u8, (rgb.green * 255.0) as u8, (rgb.blue * 255.0) as u8, 255]
        })
        .collect();
    colors.shuffle(&mut rng);
    colors
}

/// Maps the x/y plane of the simulation onto the frame. The y axis points up.
#[derive(Debug, Clone, Copy)]
struct View {
    center_x: f64,
    center_y: f64,
    pixels_per_unit: f64,
    width: u32,
    height: u32,
}

impl View {
    fn fit(trajectory: &Trajectory, extent: Option<f64>, width: u32, height: u32) -> Self {
        let (mut min_x, mut max_x, mut min_y, mut max_y) = (f64::MAX, f64::MIN, f64::MAX, f64::MIN);
        for p in trajectory.snapshots().iter().flat_map(|s| &s.positions) {
            min_x = min_x.min(p.x);
            max_x = max_x.max(p.x);
            min_y = min_y.min(p.y);
            max_y = max_y.max(p.y);
        }
        if min_x > max_x {
            (min_x, max_x, min_y, max_y) = (-1.0, 1.0, -1.0, 1.0);
        }
        let half = extent.unwrap_or_else(|| {
            // 5% padding; a degenerate extent still gets a unit view.
            let span = (max_x - min_x).max(max_y - min_y);
            if span > 0.0 { span * 0.525 } else { 1.0 }
        });
        let pixels_per_unit = (width.min(height) as f64 / 2.0) / half;
        View {
            center_x: (min_x + max_x) / 2.0,
            center_y: (min_y + max_y) / 2.0,
            pixels_per_unit,
            width,
            height,
        }
    }

    fn project(&self, x: f64, y: f64) -> (i32, i32) {
        let px = self.width as f64 / 2.0 + (x - self.center_x) * self.pixels_per_unit;
        let py = self.height as f64 / 2.0 - (y - self.center_y) * self.pixels_per_unit;
        (px.round() as i32, py.round() as i32)
    }
}

/// Circle radius per body, linear in log10(mass) between `min_radius` and `max_radius`.
fn body_radii(masses: &[f64], min_radius: f32, max_radius: f32) -> Vec<i32> {
    let logs: Vec<f64> = masses.iter().map(|m| m.max(f64::MIN_POSITIVE).log10()).collect();
    let lo = logs.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = logs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    logs.iter()
        .map(|&l| {
            let t = if hi > lo { ((l - lo) / (hi - lo)) as f32 } else { 1.0 };
            (min_radius + t * (max_radius - min_radius)).round().max(1.0) as i32
        })
        .collect()
}

struct Style<'a> {
    view: View,
    radii: &'a [i32],
    palette: &'a [[u8; 4]],
    background: [u8; 4],
}

fn draw_frame(snapshot: &Snapshot, style: &Style) -> RgbaImage {
    let view = style.view;
    let mut image = ImageBuffer::from_pixel(view.width, view.height, Rgba(style.background));
    for (i, p) in snapshot.positions.iter().enumerate() {
        let (px, py) = view.project(p.x, p.y);
        let radius = style.radii[i];
        if px + radius < 0 || py + radius < 0 || px - radius >= view.width as i32 || py - radius >= view.height as i32 {
            continue;
        }
        let color = style.palette[i % style.palette.len()];
        draw_filled_circle_mut(&mut image, (px, py), radius, Rgba(color));
    }
    image
}

/// BT.601 RGB to planar YUV 4:2:0. Width and height must be even.
fn rgb_to_yuv420(image: &RgbaImage) -> Vec<u8> {
    let width = image.width() as usize;
    let height = image.height() as usize;
    let luma = width * height;
    let mut yuv = vec![0u8; luma + luma / 2];
    let (y_plane, chroma) = yuv.split_at_mut(luma);
    let (u_plane, v_plane) = chroma.split_at_mut(luma / 4);

    for (i, pixel) in image.pixels().enumerate() {
        let [r, g, b, _] = pixel.0.map(|c| c as f32);
        y_plane[i] = (0.299 * r + 0.587 * g + 0.114 * b).round() as u8;
    }
    for cy in 0..height / 2 {
        for cx in 0..width / 2 {
            let (mut sum_u, mut sum_v) = (0.0f32, 0.0f32);
            for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                let [r, g, b, _] = image.get_pixel((2 * cx + dx) as u32, (2 * cy + dy) as u32).0.map(|c| c as f32);
                sum_u += -0.169 * r - 0.331 * g + 0.5 * b + 128.0;
                sum_v += 0.5 * r - 0.419 * g - 0.081 * b + 128.0;
            }
            u_plane[cy * (width / 2) + cx] = (sum_u / 4.0).round() as u8;
            v_plane[cy * (width / 2) + cx] = (sum_v / 4.0).round() as u8;
        }
    }
    yuv
}

fn progress_style(template: &str) -> Result<ProgressStyle> {
    Ok(ProgressStyle::default_bar()
        .template(template)
        .context("Invalid progress bar template")?
        .progress_chars("#>-"))
}

fn main() -> Result<()> {
    Builder::from_default_env().filter(None, LevelFilter::Info).init();
    let args = Args::parse();
    if let Err(e) = run_with_args(args) {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run_with_args(args: Args) -> Result<()> {
    info!("Starting Orion Visualizer...");
    let trajectory = load_trajectory(&args.input, "run")?;
    info!(
        "Loaded {} snapshots of {} bodies from {}",
        trajectory.len(),
        trajectory.n_bodies(),
        args.input.display()
    );
    if trajectory.is_empty() {
        warn!("Input file contains no snapshots. Exiting.");
        return Ok(());
    }

    // The H.264 encoder needs even dimensions.
    let width = args.width.max(2) & !1;
    let height = args.height.unwrap_or(width).max(2) & !1;
    let view = View::fit(&trajectory, args.extent, width, height);
    info!("Output video dimensions: {}x{} px at {} fps", width, height, args.fps);
    debug!("View: {:?}", view);

    let palette = if args.color.eq_ignore_ascii_case("palette") {
        generate_color_palette(trajectory.n_bodies().max(1))
    } else {
        vec![parse_color(&args.color)]
    };
    let radii = body_radii(trajectory.masses(), args.min_radius, args.max_radius);
    let style = Style { view, radii: &radii, palette: &palette, background: parse_color(&args.bg_color) };

    // --- Render frames in parallel chunks ---
    let start_time = Instant::now();
    let snapshots = trajectory.snapshots();
    let chunk_size = args.chunk_size.max(1);
    let frames: DashMap<usize, RgbaImage> = DashMap::with_capacity(snapshots.len());
    let render_progress = ProgressBar::new(snapshots.len() as u64);
    render_progress.set_style(progress_style(
        "[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} frames ({percent}%) [{eta}]",
    )?);
    snapshots.par_chunks(chunk_size).enumerate().for_each(|(chunk_idx, chunk)| {
        for (i, snapshot) in chunk.iter().enumerate() {
            frames.insert(chunk_idx * chunk_size + i, draw_frame(snapshot, &style));
        }
        render_progress.inc(chunk.len() as u64);
    });
    render_progress.finish_and_clear();
    info!("Rendered {} frames in {:.2?}", frames.len(), start_time.elapsed());

    if let Some(png_path) = &args.final_png {
        let last = snapshots.len() - 1;
        let image = frames
            .get(&last)
            .with_context(|| format!("Frame {} was not rendered", last))?;
        image
            .save(png_path)
            .with_context(|| format!("Failed to write final frame to {}", png_path.display()))?;
        info!("Final frame saved to {}", png_path.display());
    }

    // --- Encode in order ---
    let mut encoder = Encoder::with_api_config(
        openh264::OpenH264API::from_source(),
        EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(args.fps as f32))
            .bitrate(BitRate::from_bps(5_000_000)),
    )
    .context("Failed to initialize H.264 encoder")?;

    let encode_progress = ProgressBar::new(snapshots.len() as u64);
    encode_progress.set_style(progress_style(
        "[{elapsed_precise}] [{bar:40.green/blue}] {pos}/{len} encoded ({percent}%) [{eta}]",
    )?);
    let mut h264_data = Vec::new();
    const ENCODE_BATCH_SIZE: usize = 30;
    let keys: Vec<usize> = (0..snapshots.len()).collect();
    for batch in keys.chunks(ENCODE_BATCH_SIZE) {
        let yuv_frames: Vec<(usize, Vec<u8>)> = batch
            .par_iter()
            .filter_map(|&key| frames.remove(&key).map(|(_, image)| (key, rgb_to_yuv420(&image))))
            .collect();
        for (key, yuv_data) in yuv_frames {
            let source = YUVBuffer::from_vec(yuv_data, width as usize, height as usize);
            let bitstream = encoder
                .encode(&source)
                .with_context(|| format!("Failed to encode frame {}", key))?;
            bitstream.write_vec(&mut h264_data);
            encode_progress.inc(1);
        }
    }
    encode_progress.finish_and_clear();

    let mut video_buffer = Cursor::new(Vec::new());
    {
        let mut muxer = Mp4Muxer::new(&mut video_buffer);
        let description = format!("Orion N-body trajectory - {} bodies", trajectory.n_bodies());
        muxer.init_video(width as i32, height as i32, false, &description);
        muxer.write_video(&h264_data);
        muxer.close();
    }
    fs::write(&args.output, video_buffer.into_inner())
        .with_context(|| format!("Failed to write video file to {}", args.output.display()))?;

    let duration = start_time.elapsed();
    info!(
        "Video generation completed in {:.2?} ({:.1} frames per second)",
        duration,
        snapshots.len() as f64 / duration.as_secs_f64()
    );
    info!("Output saved to: {}", args.output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orion_common::Vec3;

    fn trajectory(points: &[(f64, f64)]) -> Trajectory {
        let mut trajectory = Trajectory::new(vec![1.0; points.len()]);
        let positions = points.iter().map(|&(x, y)| Vec3::new(x, y, 0.0)).collect();
        trajectory.push(Snapshot { step: 1, time: 0.0, positions }).unwrap();
        trajectory
    }

    #[test]
    fn view_keeps_every_body_in_frame() {
        let t = trajectory(&[(-100.0, 20.0), (300.0, -50.0), (0.0, 0.0)]);
        let view = View::fit(&t, None, 200, 100);
        for p in &t.snapshots()[0].positions {
            let (px, py) = view.project(p.x, p.y);
            assert!((0..200).contains(&px) && (0..100).contains(&py), "({}, {})", px, py);
        }
    }

    #[test]
    fn projection_flips_y() {
        let t = trajectory(&[(-1.0, -1.0), (1.0, 1.0)]);
        let view = View::fit(&t, Some(1.0), 100, 100);
        assert_eq!(view.project(0.0, 0.0), (50, 50));
        assert_eq!(view.project(1.0, 1.0), (100, 0));
    }

    #[test]
    fn heavier_bodies_draw_larger() {
        let radii = body_radii(&[1e9, 1e10, 1e13], 1.0, 9.0);
        assert_eq!(radii[0], 1);
        assert!(radii[1] > radii[0]);
        assert_eq!(radii[2], 9);
        assert_eq!(body_radii(&[5.0, 5.0], 1.0, 4.0), vec![4, 4]);
    }

    #[test]
    fn white_frame_converts_to_neutral_chroma() {
        let image = ImageBuffer::from_pixel(4, 2, Rgba([255, 255, 255, 255]));
        let yuv = rgb_to_yuv420(&image);
        assert_eq!(yuv.len(), 12);
        assert!(yuv[..8].iter().all(|&y| y == 255));
        assert!(yuv[8..].iter().all(|&c| (127..=129).contains(&c)));
    }

    #[test]
    fn unknown_color_falls_back_to_white() {
        assert_eq!(parse_color("Cyan"), [0, 255, 255, 255]);
        assert_eq!(parse_color("ultraviolet"), [255, 255, 255, 255]);
    }
}
