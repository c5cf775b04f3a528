//! SVG charts for training curves and the confusion matrix.
//!
//! The charts are plain SVG strings so they render in any browser without a
//! font or drawing backend.

use std::path::Path;

use log::info;

use crate::{
    error::Result,
    evaluation::ConfusionMatrix,
    history::{History, ACCURACY, LOSS, VAL_ACCURACY, VAL_LOSS},
};

const PANEL_WIDTH: f64 = 600.0;
const CHART_HEIGHT: f64 = 500.0;
const MARGIN_TOP: f64 = 60.0;
const MARGIN_RIGHT: f64 = 30.0;
const MARGIN_BOTTOM: f64 = 70.0;
const MARGIN_LEFT: f64 = 80.0;

const COLOR_TRAIN: &str = "#1f77b4";
const COLOR_VALID: &str = "#ff7f0e";
const COLOR_GRID: &str = "#ecf0f1";
const COLOR_AXIS: &str = "#2c3e50";
const COLOR_TEXT: &str = "#2c3e50";

const FONT: &str = "Arial, sans-serif";

struct Series<'a> {
    name: &'a str,
    values: &'a [f64],
    color: &'a str,
}

#[derive(Clone, Copy, PartialEq)]
enum LegendCorner {
    LowerRight,
    UpperRight,
}

/// Writes accuracy (left) and loss (right) per epoch, training against validation.
pub fn render_training_curves<P: AsRef<Path>>(history: &History, path: P) -> Result<()> {
    let width = PANEL_WIDTH * 2.0;
    let mut svg = svg_header(width, CHART_HEIGHT);

    line_panel(
        &mut svg,
        0.0,
        "Model Accuracy",
        "Accuracy",
        &curve_pair(history, ACCURACY, VAL_ACCURACY, "Training Accuracy", "Validation Accuracy"),
        LegendCorner::LowerRight,
    );
    line_panel(
        &mut svg,
        PANEL_WIDTH,
        "Model Loss",
        "Loss",
        &curve_pair(history, LOSS, VAL_LOSS, "Training Loss", "Validation Loss"),
        LegendCorner::UpperRight,
    );

    svg.push_str("</svg>");
    std::fs::write(path.as_ref(), svg)?;
    info!("Wrote training curves to {}", path.as_ref().display());
    Ok(())
}

fn curve_pair<'a>(
    history: &'a History,
    train: &str,
    valid: &str,
    train_name: &'a str,
    valid_name: &'a str,
) -> [Series<'a>; 2] {
    [
        Series {
            name: train_name,
            values: history.get(train).unwrap_or(&[]),
            color: COLOR_TRAIN,
        },
        Series {
            name: valid_name,
            values: history.get(valid).unwrap_or(&[]),
            color: COLOR_VALID,
        },
    ]
}

fn line_panel(
    svg: &mut String,
    offset_x: f64,
    title: &str,
    y_label: &str,
    series: &[Series],
    legend: LegendCorner,
) {
    let left = offset_x + MARGIN_LEFT;
    let plot_width = PANEL_WIDTH - MARGIN_LEFT - MARGIN_RIGHT;
    let plot_height = CHART_HEIGHT - MARGIN_TOP - MARGIN_BOTTOM;
    let bottom = MARGIN_TOP + plot_height;

    let epochs = series.iter().map(|s| s.values.len()).max().unwrap_or(0);
    let x_span = epochs.saturating_sub(1).max(1) as f64;
    let (y_min, y_max) = value_range(series.iter().flat_map(|s| s.values.iter().copied()));

    let to_x = |epoch: usize| left + epoch as f64 / x_span * plot_width;
    let to_y = |value: f64| bottom - (value - y_min) / (y_max - y_min) * plot_height;

    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="{FONT}" font-size="18" font-weight="bold" fill="{COLOR_TEXT}">{}</text>"#,
        left + plot_width / 2.0,
        escape_xml(title)
    ));

    // Horizontal grid with y tick labels
    for i in 0..=5 {
        let value = y_min + i as f64 / 5.0 * (y_max - y_min);
        let y = to_y(value);
        svg.push_str(&format!(
            r#"<line x1="{left}" y1="{y}" x2="{}" y2="{y}" stroke="{COLOR_GRID}" stroke-width="1"/>"#,
            left + plot_width
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" font-family="{FONT}" font-size="12" fill="{COLOR_TEXT}">{value:.3}</text>"#,
            left - 10.0,
            y + 4.0
        ));
    }

    svg.push_str(&format!(
        r#"<line x1="{left}" y1="{bottom}" x2="{}" y2="{bottom}" stroke="{COLOR_AXIS}" stroke-width="2"/>"#,
        left + plot_width
    ));
    svg.push_str(&format!(
        r#"<line x1="{left}" y1="{MARGIN_TOP}" x2="{left}" y2="{bottom}" stroke="{COLOR_AXIS}" stroke-width="2"/>"#
    ));

    let tick_step = (epochs / 10).max(1);
    for epoch in (0..epochs).step_by(tick_step) {
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="middle" font-family="{FONT}" font-size="11" fill="{COLOR_TEXT}">{epoch}</text>"#,
            to_x(epoch),
            bottom + 20.0
        ));
    }

    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="{FONT}" font-size="14" fill="{COLOR_TEXT}">Epoch</text>"#,
        left + plot_width / 2.0,
        CHART_HEIGHT - 20.0
    ));
    let label_x = offset_x + 20.0;
    let label_y = CHART_HEIGHT / 2.0;
    svg.push_str(&format!(
        r#"<text x="{label_x}" y="{label_y}" text-anchor="middle" font-family="{FONT}" font-size="14" fill="{COLOR_TEXT}" transform="rotate(-90 {label_x} {label_y})">{}</text>"#,
        escape_xml(y_label)
    ));

    for s in series {
        // Non-finite epochs break the line instead of distorting the scale
        let mut path = String::new();
        let mut pen_down = false;
        for (epoch, &value) in s.values.iter().enumerate() {
            if !value.is_finite() {
                pen_down = false;
                continue;
            }
            let command = if pen_down { " L" } else { " M" };
            path.push_str(&format!("{command} {:.2} {:.2}", to_x(epoch), to_y(value)));
            pen_down = true;
        }
        if !path.is_empty() {
            svg.push_str(&format!(
                r#"<path class="series" d="{}" fill="none" stroke="{}" stroke-width="2"/>"#,
                path.trim_start(),
                s.color
            ));
        }
    }

    let legend_x = left + plot_width - 170.0;
    let mut legend_y = match legend {
        LegendCorner::UpperRight => MARGIN_TOP + 10.0,
        LegendCorner::LowerRight => bottom - 25.0 * series.len() as f64 - 5.0,
    };
    for s in series {
        svg.push_str(&format!(
            r#"<rect x="{legend_x}" y="{legend_y}" width="15" height="15" fill="{}"/>"#,
            s.color
        ));
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" font-family="{FONT}" font-size="12" fill="{COLOR_TEXT}">{}</text>"#,
            legend_x + 20.0,
            legend_y + 12.0,
            escape_xml(s.name)
        ));
        legend_y += 25.0;
    }
}

/// Writes a heat map with true labels as rows and predicted labels as columns.
pub fn render_confusion_matrix<P: AsRef<Path>>(
    matrix: &ConfusionMatrix,
    labels: &[String],
    path: P,
) -> Result<()> {
    let num_classes = matrix.num_classes();
    let cell = (600.0 / num_classes.max(1) as f64).clamp(18.0, 60.0);
    let label_space = 40.0 + 7.0 * labels.iter().map(String::len).max().unwrap_or(1) as f64;
    let grid = cell * num_classes as f64;

    let left = label_space + 40.0;
    let top = MARGIN_TOP;
    let width = left + grid + MARGIN_RIGHT;
    let height = top + grid + label_space + 30.0;

    let max_count = matrix.max_count().max(1) as f64;
    let font_size = (cell * 0.3).clamp(8.0, 14.0);

    let mut svg = svg_header(width, height);
    svg.push_str(&format!(
        r#"<text x="{}" y="35" text-anchor="middle" font-family="{FONT}" font-size="18" font-weight="bold" fill="{COLOR_TEXT}">Confusion Matrix</text>"#,
        left + grid / 2.0
    ));

    for (actual, row) in matrix.rows().iter().enumerate() {
        for (predicted, &count) in row.iter().enumerate() {
            let x = left + predicted as f64 * cell;
            let y = top + actual as f64 * cell;
            let intensity = count as f64 / max_count;
            svg.push_str(&format!(
                r#"<rect class="cell" x="{x}" y="{y}" width="{cell}" height="{cell}" fill="{}" stroke="white" stroke-width="1"/>"#,
                blues(intensity)
            ));
            let text_color = if intensity > 0.5 { "white" } else { "black" };
            svg.push_str(&format!(
                r#"<text x="{}" y="{}" text-anchor="middle" dominant-baseline="middle" font-family="{FONT}" font-size="{font_size}" fill="{text_color}">{count}</text>"#,
                x + cell / 2.0,
                y + cell / 2.0
            ));
        }
    }

    for (index, label) in labels.iter().take(num_classes).enumerate() {
        let center = index as f64 * cell + cell / 2.0;
        let label = escape_xml(label);

        // Row tick on the left
        svg.push_str(&format!(
            r#"<text x="{}" y="{}" text-anchor="end" dominant-baseline="middle" font-family="{FONT}" font-size="11" fill="{COLOR_TEXT}">{label}</text>"#,
            left - 6.0,
            top + center
        ));
        // Column tick below, rotated 45 degrees
        let x = left + center;
        let y = top + grid + 10.0;
        svg.push_str(&format!(
            r#"<text x="{x}" y="{y}" text-anchor="end" font-family="{FONT}" font-size="11" fill="{COLOR_TEXT}" transform="rotate(-45 {x} {y})">{label}</text>"#
        ));
    }

    svg.push_str(&format!(
        r#"<text x="{}" y="{}" text-anchor="middle" font-family="{FONT}" font-size="14" fill="{COLOR_TEXT}">Predicted Label</text>"#,
        left + grid / 2.0,
        height - 15.0
    ));
    let label_y = top + grid / 2.0;
    svg.push_str(&format!(
        r#"<text x="20" y="{label_y}" text-anchor="middle" font-family="{FONT}" font-size="14" fill="{COLOR_TEXT}" transform="rotate(-90 20 {label_y})">True Label</text>"#
    ));

    svg.push_str("</svg>");
    std::fs::write(path.as_ref(), svg)?;
    info!("Wrote confusion matrix to {}", path.as_ref().display());
    Ok(())
}

fn svg_header(width: f64, height: f64) -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 {width} {height}" width="{width}" height="{height}"><rect width="{width}" height="{height}" fill="white"/>"#
    )
}

/// Padded `(min, max)` over the finite values, `(0, 1)` when there are none.
fn value_range(values: impl Iterator<Item = f64>) -> (f64, f64) {
    let (min, max) = values
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if min > max {
        return (0.0, 1.0);
    }
    let pad = if max > min { (max - min) * 0.05 } else { 0.5 };
    (min - pad, max + pad)
}

/// White to dark blue ramp for `t` in `[0, 1]`.
fn blues(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let mix = |from: f64, to: f64| (from + (to - from) * t).round() as u8;
    format!(
        "#{:02x}{:02x}{:02x}",
        mix(247.0, 8.0),
        mix(251.0, 48.0),
        mix(255.0, 107.0)
    )
}

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn training_curves_have_four_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("training_curves.svg");

        let mut history = History::new();
        for epoch in 0..4 {
            let e = epoch as f64;
            history.record(ACCURACY, 0.5 + e * 0.1);
            history.record(VAL_ACCURACY, 0.45 + e * 0.1);
            history.record(LOSS, 1.0 - e * 0.2);
            history.record(VAL_LOSS, 1.1 - e * 0.2);
        }
        render_training_curves(&history, &path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert!(svg.starts_with("<svg"));
        assert!(svg.ends_with("</svg>"));
        assert!(svg.contains("Model Accuracy"));
        assert!(svg.contains("Model Loss"));
        assert!(svg.contains("Validation Loss"));
        assert_eq!(svg.matches(r#"class="series""#).count(), 4);
    }

    #[test]
    fn single_epoch_and_missing_series_render() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("curves.svg");

        let mut history = History::new();
        history.record(LOSS, 0.7);
        history.record(VAL_LOSS, f64::NAN);
        render_training_curves(&history, &path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert_eq!(svg.matches(r#"class="series""#).count(), 1);
        assert!(!svg.contains("NaN"));
    }

    #[test]
    fn confusion_matrix_cells_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confusion_matrix.svg");

        let matrix = ConfusionMatrix::from_predictions(3, &[0, 0, 1, 2, 2, 2], &[0, 1, 1, 2, 2, 0]);
        let labels = vec![
            "Tomato_healthy".to_string(),
            "Tomato <leaf> mold".to_string(),
            "Rust & blight".to_string(),
        ];
        render_confusion_matrix(&matrix, &labels, &path).unwrap();

        let svg = std::fs::read_to_string(&path).unwrap();
        assert_eq!(svg.matches(r#"class="cell""#).count(), 9);
        assert!(svg.contains(">2</text>"));
        assert!(svg.contains("Tomato &lt;leaf&gt; mold"));
        assert!(svg.contains("Rust &amp; blight"));
        assert!(svg.contains("Predicted Label"));
        assert!(svg.contains("True Label"));
    }

    #[test]
    fn colour_ramp_endpoints() {
        assert_eq!(blues(0.0), "#f7fbff");
        assert_eq!(blues(1.0), "#08306b");
        assert_eq!(value_range([f64::NAN].into_iter()), (0.0, 1.0));
        assert_eq!(value_range([2.0, 2.0].into_iter()), (1.5, 2.5));
    }
}
