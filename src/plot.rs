//! Hypnogram figure export.

use std::io::Cursor;
use std::path::Path;

use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use plotters::prelude::*;

use crate::error::{Result, SleepError};
use crate::stages::StageDict;

#[derive(Debug, Clone)]
pub struct HypnoStyle {
    pub width: u32,
    pub height: u32,
    /// Pixel density; 100 keeps `width` x `height`.
    pub dpi: u32,
    pub grid: bool,
    /// Single line colour; `None` draws each stage in its dictionary colour.
    pub color: Option<String>,
    /// Axis labels and caption. Needs system fonts.
    pub labels: bool,
}

impl Default for HypnoStyle {
    fn default() -> Self {
        Self {
            width: 1200,
            height: 300,
            dpi: 100,
            grid: true,
            color: None,
            labels: true,
        }
    }
}

/// `#rrggbb` or a handful of plain names.
pub fn parse_color(text: &str) -> Option<RGBColor> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix('#') {
        if hex.len() != 6 {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        return Some(RGBColor(channel(0)?, channel(2)?, channel(4)?));
    }
    let color = match text.to_ascii_lowercase().as_str() {
        "black" => BLACK,
        "white" => WHITE,
        "red" => RED,
        "green" => GREEN,
        "blue" => BLUE,
        "cyan" => CYAN,
        "magenta" => MAGENTA,
        "yellow" => YELLOW,
        "gray" | "grey" => RGBColor(128, 128, 128),
        "orange" => RGBColor(255, 165, 0),
        _ => return None,
    };
    Some(color)
}

/// `(start, end, code)` half-open runs.
fn runs(hypno: &[i32]) -> Vec<(usize, usize, i32)> {
    let mut out = Vec::new();
    let mut start = 0;
    for i in 1..=hypno.len() {
        if i == hypno.len() || hypno[i] != hypno[start] {
            out.push((start, i, hypno[start]));
            start = i;
        }
    }
    out
}

pub fn render_hypnogram_png(hypno: &[i32], sf: f64, stages: &StageDict, style: &HypnoStyle) -> Result<Vec<u8>> {
    if hypno.is_empty() {
        return Err(SleepError::Plot("hypnogram is empty".to_owned()));
    }
    let single = match &style.color {
        Some(name) => Some(
            parse_color(name).ok_or_else(|| SleepError::InvalidArgument(format!("unknown colour '{name}'")))?,
        ),
        None => None,
    };
    let href = stages.href();
    let rank = |code: i32| -> f64 {
        stages
            .name_of(code)
            .and_then(|name| href.iter().position(|h| h == name))
            .map_or(0.0, |r| -(r as f64))
    };
    let hours = |i: usize| i as f64 / sf / 3600.0;
    let x_max = hours(hypno.len());
    let y_min = -(href.len() as f64) + 0.5;

    let width = style.width * style.dpi / 100;
    let height = style.height * style.dpi / 100;
    let mut buffer = vec![0u8; (width * height * 3) as usize];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        root.fill(&WHITE)?;
        let mut builder = ChartBuilder::on(&root);
        builder.margin(10);
        if style.labels {
            builder
                .set_label_area_size(LabelAreaPosition::Left, 60)
                .set_label_area_size(LabelAreaPosition::Bottom, 40);
        }
        let mut chart = builder.build_cartesian_2d(0f64..x_max, y_min..0.5)?;
        if style.labels {
            let names = href.clone();
            chart
                .configure_mesh()
                .disable_mesh()
                .x_desc("Time (h)")
                .y_labels(href.len())
                .y_label_formatter(&move |y: &f64| {
                    let r = (-y).round();
                    if r >= 0.0 && (y + r).abs() < 1e-6 {
                        names.get(r as usize).cloned().unwrap_or_default()
                    } else {
                        String::new()
                    }
                })
                .draw()?;
        }
        if style.grid {
            let grid = RGBColor(200, 200, 200);
            for r in 0..href.len() {
                let y = -(r as f64);
                chart.draw_series(LineSeries::new([(0.0, y), (x_max, y)], &grid))?;
            }
            let mut h = 1.0;
            while h < x_max {
                chart.draw_series(LineSeries::new([(h, y_min), (h, 0.5)], &grid))?;
                h += 1.0;
            }
        }

        let runs = runs(hypno);
        let steps: Vec<(f64, f64)> = runs
            .iter()
            .flat_map(|&(s, e, code)| [(hours(s), rank(code)), (hours(e), rank(code))])
            .collect();
        let line = single.unwrap_or(BLACK);
        chart.draw_series(LineSeries::new(steps, &line))?;
        if single.is_none() {
            for &(s, e, code) in &runs {
                let color = stages
                    .by_value(code)
                    .and_then(|info| parse_color(&info.color))
                    .unwrap_or(BLACK);
                let y = rank(code);
                chart.draw_series(LineSeries::new(
                    [(hours(s), y), (hours(e), y)],
                    color.stroke_width(3),
                ))?;
            }
        }
        root.present()?;
    }
    encode_png(&buffer, width, height)
}

fn encode_png(buffer: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let image = ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, buffer.to_vec())
        .ok_or_else(|| SleepError::Plot("failed to allocate image buffer".to_owned()))?;
    let mut output = Vec::new();
    DynamicImage::ImageRgb8(image).write_to(&mut Cursor::new(&mut output), ImageFormat::Png)?;
    Ok(output)
}

pub fn save_hypnogram_png(
    path: impl AsRef<Path>,
    hypno: &[i32],
    sf: f64,
    stages: &StageDict,
    style: &HypnoStyle,
) -> Result<()> {
    let png = render_hypnogram_png(hypno, sf, stages, style)?;
    std::fs::write(path.as_ref(), png)?;
    log::info!("Hypnogram figure saved to {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> HypnoStyle {
        HypnoStyle {
            width: 400,
            height: 120,
            labels: false,
            ..Default::default()
        }
    }

    #[test]
    fn colours() {
        assert_eq!(parse_color("#bf5656"), Some(RGBColor(0xbf, 0x56, 0x56)));
        assert_eq!(parse_color("Grey"), Some(RGBColor(128, 128, 128)));
        assert_eq!(parse_color("#12"), None);
        assert_eq!(parse_color("plaid"), None);
    }

    #[test]
    fn runs_cover_the_vector() {
        assert_eq!(runs(&[0, 0, 2, 2, 2, 4]), vec![(0, 2, 0), (2, 5, 2), (5, 6, 4)]);
    }

    #[test]
    fn renders_png_at_dpi() {
        let mut hypno = vec![0; 600];
        hypno[100..300].fill(2);
        hypno[300..400].fill(4);
        let style = HypnoStyle { dpi: 200, ..quiet() };
        let png = render_hypnogram_png(&hypno, 1.0 / 30.0, &StageDict::default(), &style).unwrap();
        let decoded = image::load_from_memory(&png).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (800, 240));

        let style = HypnoStyle {
            color: Some("purple-ish".to_owned()),
            ..quiet()
        };
        assert!(render_hypnogram_png(&hypno, 1.0, &StageDict::default(), &style).is_err());
        assert!(render_hypnogram_png(&[], 1.0, &StageDict::default(), &quiet()).is_err());
    }
}
