#![cfg(not(tarpaulin_include))]
#![cfg(feature = "web")]
use plotters::coord::Shift;
use plotters::prelude::*;
use std::io::Cursor;
use std::ops::Range;
use std::str::FromStr;

use crate::error::{DashboardError, Result};
use crate::transform::{CategoryTotal, MonthlyPoint};

/// Available graph types supported by the dashboard
///
/// This enum defines the different visualization formats that can be generated
/// from an aggregated series.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GraphType {
    /// Line graph - Shows trends over time with lines connecting data points
    Line,

    /// Bar graph - Compares values across different categories with rectangular bars
    Bar,

    /// Scatter plot - Shows individual values as points
    Scatter,

    /// Area graph - Similar to line graphs but with the area below the line filled in
    Area,
}

impl FromStr for GraphType {
    type Err = DashboardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "line" => Ok(GraphType::Line),
            "bar" => Ok(GraphType::Bar),
            "scatter" => Ok(GraphType::Scatter),
            "area" => Ok(GraphType::Area),
            other => Err(DashboardError::Parse(format!("unknown graph type '{}'", other))),
        }
    }
}

/// Configuration options for graph generation
///
/// This structure contains all the customizable properties for generating
/// different types of graphs.
#[derive(Clone, Debug)]
pub struct GraphOptions {
    /// Title displayed at the top of the graph
    pub title: String,

    /// Label for the X-axis
    pub x_label: String,

    /// Label for the Y-axis
    pub y_label: String,

    /// Width of the graph in pixels
    pub width: u32,

    /// Height of the graph in pixels
    pub height: u32,

    /// Type of graph to generate
    pub graph_type: GraphType,
}

impl Default for GraphOptions {
    /// Creates a default configuration for graph generation
    ///
    /// # Returns
    /// * `GraphOptions` - Default configuration with:
    ///   - Line graph type
    ///   - 800x600 pixel dimensions
    ///   - Generic labels
    fn default() -> Self {
        Self {
            title: "Graph".to_string(),
            x_label: "X Axis".to_string(),
            y_label: "Y Axis".to_string(),
            width: 800,
            height: 600,
            graph_type: GraphType::Line,
        }
    }
}

/// Values placed at consecutive positions of a categorical X axis
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChartSeries {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl ChartSeries {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Monthly totals as a chart series, labelled `YYYY-MM`
pub fn monthly_chart_series(points: &[MonthlyPoint]) -> ChartSeries {
    ChartSeries {
        labels: points.iter().map(|p| p.label.clone()).collect(),
        values: points.iter().map(|p| p.total).collect(),
    }
}

/// Category totals as a chart series, in the given order
pub fn category_chart_series(groups: &[CategoryTotal]) -> ChartSeries {
    ChartSeries {
        labels: groups.iter().map(|g| g.category.clone()).collect(),
        values: groups.iter().map(|g| g.total).collect(),
    }
}

/// Creates a PNG image of a series
///
/// # Arguments
/// * `series` - Labels and values to plot
/// * `options` - Graph styling and type options
///
/// # Returns
/// * A Result containing the PNG image data as bytes or an error
///
/// # Implementation Notes
/// * Draws into an in-memory RGB buffer and encodes it, no temporary file is involved
pub fn render_png(series: &ChartSeries, options: &GraphOptions) -> Result<Vec<u8>> {
    check_series(series, options)?;

    let (width, height) = (options.width, options.height);
    let mut buffer = vec![0u8; width as usize * height as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (width, height)).into_drawing_area();
        draw_chart(&root, series, options)?;
        root.present().map_err(chart_error)?;
    }

    let image = image::RgbImage::from_raw(width, height, buffer)
        .ok_or_else(|| DashboardError::Chart("bitmap buffer has the wrong size".into()))?;
    let mut png = Cursor::new(Vec::new());
    image
        .write_to(&mut png, image::ImageOutputFormat::Png)
        .map_err(chart_error)?;
    Ok(png.into_inner())
}

/// Creates an SVG document of a series
///
/// Same layout as [`render_png`]; suitable for embedding or scaling in the browser.
pub fn render_svg(series: &ChartSeries, options: &GraphOptions) -> Result<String> {
    check_series(series, options)?;

    let mut svg = String::new();
    {
        let root =
            SVGBackend::with_string(&mut svg, (options.width, options.height)).into_drawing_area();
        draw_chart(&root, series, options)?;
        root.present().map_err(chart_error)?;
    }
    Ok(svg)
}

fn check_series(series: &ChartSeries, options: &GraphOptions) -> Result<()> {
    if series.is_empty() {
        return Err(DashboardError::Chart("no data to plot".into()));
    }
    if series.labels.len() != series.values.len() {
        return Err(DashboardError::Chart(
            "labels and values must have the same length".into(),
        ));
    }
    if options.width == 0 || options.height == 0 {
        return Err(DashboardError::Chart("graph dimensions must be positive".into()));
    }
    Ok(())
}

fn chart_error<E: std::fmt::Display>(e: E) -> DashboardError {
    DashboardError::Chart(e.to_string())
}

/// Y range that always contains zero, padded by 5% of the span
pub(crate) fn value_range(values: &[f64]) -> Range<f64> {
    let min = values.iter().copied().fold(0.0, f64::min);
    let max = values.iter().copied().fold(0.0, f64::max);
    let span = max - min;
    let pad = if span > 0.0 { span * 0.05 } else { 1.0 };
    let low = if min < 0.0 { min - pad } else { 0.0 };
    let high = if max > 0.0 || min >= 0.0 { max + pad } else { 0.0 };
    low..high
}

/// Label of the category at an axis position, blank between positions
pub(crate) fn label_at(labels: &[String], x: f64) -> String {
    let index = x.round();
    if (x - index).abs() > 0.01 || index < 0.0 {
        return String::new();
    }
    labels.get(index as usize).cloned().unwrap_or_default()
}

/// Draws the series on any plotters backend
///
/// Positions run from 0 to n-1 with half a step of margin on each side.
fn draw_chart<DB: DrawingBackend>(
    root: &DrawingArea<DB, Shift>,
    series: &ChartSeries,
    options: &GraphOptions,
) -> Result<()> {
    root.fill(&WHITE).map_err(chart_error)?;

    let count = series.values.len();
    let x_range = -0.5f64..(count as f64 - 0.5);
    let y_range = value_range(&series.values);
    let baseline = 0.0f64.clamp(y_range.start, y_range.end);

    let mut chart = ChartBuilder::on(root)
        .caption(&options.title, ("sans-serif", 24).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(70)
        .build_cartesian_2d(x_range, y_range)
        .map_err(chart_error)?;

    let labels = &series.labels;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .x_labels(count.min(12))
        .x_label_formatter(&|x| label_at(labels, *x))
        .x_desc(&options.x_label)
        .y_desc(&options.y_label)
        .draw()
        .map_err(chart_error)?;

    let points: Vec<(f64, f64)> = series
        .values
        .iter()
        .enumerate()
        .map(|(i, v)| (i as f64, *v))
        .collect();

    match options.graph_type {
        GraphType::Line => {
            chart
                .draw_series(LineSeries::new(points.iter().copied(), &BLUE))
                .map_err(chart_error)?;
            chart
                .draw_series(points.iter().map(|&p| Circle::new(p, 3, BLUE.filled())))
                .map_err(chart_error)?;
        }
        GraphType::Bar => {
            chart
                .draw_series(points.iter().map(|&(x, y)| {
                    Rectangle::new([(x - 0.35, baseline), (x + 0.35, y)], BLUE.filled())
                }))
                .map_err(chart_error)?;
        }
        GraphType::Scatter => {
            chart
                .draw_series(points.iter().map(|&p| Circle::new(p, 5, BLUE.filled())))
                .map_err(chart_error)?;
        }
        GraphType::Area => {
            chart
                .draw_series(
                    AreaSeries::new(points.iter().copied(), baseline, BLUE.mix(0.3))
                        .border_style(&BLUE),
                )
                .map_err(chart_error)?;
        }
    }

    Ok(())
}
