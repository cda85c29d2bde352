//! Acquisition plans.
//!
//! A plan names the axes to walk (positions × timepoints × channels, plus an optional
//! focus axis), the drive strategy, and the time-lapse interval. It is built once,
//! validated, and then treated as immutable for the duration of the run.
//!
//! Plans are serde types so they can be loaded from TOML:
//!
//! ```toml
//! positions = 2
//! timepoints = 10
//! interval_ms = 500.0
//! strategy = "stepwise_timed"
//! z_offsets_um = [0.0, 5.0, 10.0]
//!
//! [[channels]]
//! name = "DAPI"
//! exposure_ms = 20.0
//! intensity = 0.8
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::data::PixelType;
use crate::error::{AcqError, AcqResult};
use crate::experiment::coords::{Coordinate, Shape};
use crate::hardware::capabilities::FrameGeometry;

/// How frames are obtained from the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One triggered snap per coordinate, timepoints paced by the interval
    #[default]
    StepwiseTimed,
    /// One burst for the whole run, drained from the source buffer
    ContinuousBuffered,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::StepwiseTimed => write!(f, "stepwise_timed"),
            Strategy::ContinuousBuffered => write!(f, "continuous_buffered"),
        }
    }
}

impl FromStr for Strategy {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stepwise" | "stepwise_timed" => Ok(Strategy::StepwiseTimed),
            "continuous" | "continuous_buffered" => Ok(Strategy::ContinuousBuffered),
            other => Err(AcqError::InvalidParameters(format!(
                "unknown strategy '{}', expected stepwise or continuous",
                other
            ))),
        }
    }
}

/// One acquisition axis, listed outer to inner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Axis {
    /// Stage position
    Position,
    /// Time-lapse timepoint
    Time,
    /// Illumination channel
    Channel,
    /// Focus offset
    Z,
}

impl Axis {
    /// Lowercase axis label used in metadata and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Axis::Position => "position",
            Axis::Time => "time",
            Axis::Channel => "channel",
            Axis::Z => "z",
        }
    }
}

/// Illumination/exposure settings for one channel.
///
/// The values are recorded in metadata; applying them to the hardware is the device
/// configurator's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Unique channel name
    pub name: String,
    /// Exposure time in milliseconds
    #[serde(default)]
    pub exposure_ms: f64,
    /// Relative illumination intensity
    #[serde(default = "default_intensity")]
    pub intensity: f64,
}

fn default_intensity() -> f64 {
    1.0
}

impl ChannelSpec {
    /// Channel with the given name, exposure and intensity.
    pub fn new(name: impl Into<String>, exposure_ms: f64, intensity: f64) -> Self {
        Self {
            name: name.into(),
            exposure_ms,
            intensity,
        }
    }
}

fn one() -> u64 {
    1
}

/// A complete multi-dimensional acquisition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionPlan {
    /// Stage positions, the outermost axis
    #[serde(default = "one")]
    pub positions: u64,
    /// Timepoints
    #[serde(default = "one")]
    pub timepoints: u64,
    /// Empty means one implicit, unnamed channel
    #[serde(default)]
    pub channels: Vec<ChannelSpec>,
    /// Focus offsets in micrometres; empty means no z axis
    #[serde(default)]
    pub z_offsets_um: Vec<f64>,
    /// How frames are obtained
    #[serde(default)]
    pub strategy: Strategy,
    /// Time-lapse interval between timepoint starts
    #[serde(default)]
    pub interval_ms: f64,
}

impl Default for AcquisitionPlan {
    fn default() -> Self {
        Self {
            positions: 1,
            timepoints: 1,
            channels: Vec::new(),
            z_offsets_um: Vec::new(),
            strategy: Strategy::default(),
            interval_ms: 0.0,
        }
    }
}

impl AcquisitionPlan {
    /// Start a plan from the defaults: one position, one timepoint, no channels.
    pub fn builder() -> AcquisitionPlanBuilder {
        AcquisitionPlanBuilder::default()
    }

    /// Parse and validate a plan from TOML text.
    pub fn from_toml(text: &str) -> AcqResult<Self> {
        let plan: AcquisitionPlan = toml::from_str(text)
            .map_err(|e| AcqError::InvalidParameters(format!("plan parse error: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    /// Check the plan can execute.
    ///
    /// Rejects zero-length axes, a negative or unrepresentable interval, empty or duplicate
    /// channel names, negative exposures and non-finite focus offsets.
    pub fn validate(&self) -> AcqResult<()> {
        if self.positions == 0 {
            return Err(AcqError::InvalidParameters(
                "positions must be at least 1".into(),
            ));
        }
        if self.timepoints == 0 {
            return Err(AcqError::InvalidParameters(
                "timepoints must be at least 1".into(),
            ));
        }
        let representable = Duration::try_from_secs_f64(self.interval_ms / 1000.0).is_ok();
        if self.interval_ms < 0.0 || !representable {
            return Err(AcqError::InvalidParameters(format!(
                "interval must be a non-negative, representable number of milliseconds, got {}",
                self.interval_ms
            )));
        }

        let mut names = HashSet::new();
        for channel in &self.channels {
            if channel.name.trim().is_empty() {
                return Err(AcqError::InvalidParameters(
                    "channel name must not be empty".into(),
                ));
            }
            if !names.insert(channel.name.as_str()) {
                return Err(AcqError::InvalidParameters(format!(
                    "duplicate channel '{}'",
                    channel.name
                )));
            }
            if !channel.exposure_ms.is_finite() || channel.exposure_ms < 0.0 {
                return Err(AcqError::InvalidParameters(format!(
                    "channel '{}' has invalid exposure {}",
                    channel.name, channel.exposure_ms
                )));
            }
        }

        if let Some(bad) = self.z_offsets_um.iter().find(|z| !z.is_finite()) {
            return Err(AcqError::InvalidParameters(format!(
                "invalid z offset {}",
                bad
            )));
        }

        self.shape().map(|_| ())
    }

    /// Number of channels, counting the implicit one.
    pub fn channel_count(&self) -> u64 {
        (self.channels.len() as u64).max(1)
    }

    /// Time-lapse interval. Negative or NaN values map to zero and values too large
    /// for a [`Duration`] saturate; [`validate`](Self::validate) rejects both.
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.interval_ms.max(0.0) / 1000.0).unwrap_or(Duration::MAX)
    }

    /// Axes in dataset order, outer to inner.
    pub fn axes(&self) -> Vec<Axis> {
        let mut axes = vec![Axis::Position, Axis::Time, Axis::Channel];
        if !self.z_offsets_um.is_empty() {
            axes.push(Axis::Z);
        }
        axes
    }

    /// Index of `axis` in the shape, if present.
    pub fn axis_index(&self, axis: Axis) -> Option<usize> {
        self.axes().iter().position(|a| *a == axis)
    }

    /// Shape of the run: `[positions, timepoints, channels(, z)]`.
    pub fn shape(&self) -> AcqResult<Shape> {
        let mut dims = vec![self.positions, self.timepoints, self.channel_count()];
        if !self.z_offsets_um.is_empty() {
            dims.push(self.z_offsets_um.len() as u64);
        }
        Shape::new(dims)
    }

    /// Channel name for a channel index, `None` for the implicit channel.
    pub fn channel_name(&self, index: u64) -> Option<&str> {
        self.channels.get(index as usize).map(|c| c.name.as_str())
    }

    /// Summary metadata JSON written when the dataset is created.
    pub fn summary_metadata(
        &self,
        geometry: FrameGeometry,
        pixel_type: PixelType,
        start_time: DateTime<Utc>,
    ) -> AcqResult<String> {
        let shape = self.shape()?;
        let axes: Vec<&str> = self.axes().iter().map(Axis::name).collect();
        let ch_names: Vec<&str> = self.channels.iter().map(|c| c.name.as_str()).collect();

        let summary = json!({
            "Summary": {
                "ChNames": ch_names,
                "Axes": axes,
                "Shape": shape.dims(),
                "Strategy": self.strategy.to_string(),
                "IntervalMs": self.interval_ms,
                "Channels": self.channels,
                "ZOffsetsUm": self.z_offsets_um,
                "Width": geometry.width,
                "Height": geometry.height,
                "PixelType": pixel_type.to_string(),
                "StartTime": start_time.to_rfc3339(),
            }
        });
        Ok(serde_json::to_string(&summary)?)
    }

    /// Per-image metadata JSON: the frame's own tags plus the step's position in the run.
    pub fn image_metadata(
        &self,
        index: u64,
        coordinate: &Coordinate,
        tags: &Map<String, Value>,
        elapsed_ms: f64,
    ) -> AcqResult<String> {
        let mut meta = tags.clone();
        meta.insert("Image-index".into(), index.into());
        for (axis, value) in self.axes().iter().zip(coordinate.as_slice()) {
            meta.insert(axis.name().into(), (*value).into());
        }
        if let Some(c) = self.axis_index(Axis::Channel).and_then(|i| coordinate.get(i)) {
            if let Some(name) = self.channel_name(c) {
                meta.insert("Channel".into(), name.into());
            }
        }
        if let Some(z) = self.axis_index(Axis::Z).and_then(|i| coordinate.get(i)) {
            if let Some(offset) = self.z_offsets_um.get(z as usize) {
                meta.insert("ZOffsetUm".into(), json!(offset));
            }
        }
        meta.insert("ElapsedMs".into(), json!(elapsed_ms));
        Ok(serde_json::to_string(&Value::Object(meta))?)
    }
}

/// Fluent constructor for [`AcquisitionPlan`]; `build` validates.
///
/// # Example
///
/// ```rust,ignore
/// let plan = AcquisitionPlan::builder()
///     .positions(2)
///     .timepoints(3)
///     .channel(ChannelSpec::new("GFP", 20.0, 1.0))
///     .interval(Duration::from_millis(100))
///     .build()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct AcquisitionPlanBuilder {
    plan: AcquisitionPlan,
}

impl AcquisitionPlanBuilder {
    /// Number of stage positions.
    pub fn positions(mut self, positions: u64) -> Self {
        self.plan.positions = positions;
        self
    }

    /// Number of timepoints.
    pub fn timepoints(mut self, timepoints: u64) -> Self {
        self.plan.timepoints = timepoints;
        self
    }

    /// Append one channel.
    pub fn channel(mut self, channel: ChannelSpec) -> Self {
        self.plan.channels.push(channel);
        self
    }

    /// Append several channels in order.
    pub fn channels(mut self, channels: impl IntoIterator<Item = ChannelSpec>) -> Self {
        self.plan.channels.extend(channels);
        self
    }

    /// Focus offsets in micrometres; empty means no Z axis.
    pub fn z_offsets_um(mut self, offsets: impl Into<Vec<f64>>) -> Self {
        self.plan.z_offsets_um = offsets.into();
        self
    }

    /// Drive strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.plan.strategy = strategy;
        self
    }

    /// Time-lapse interval.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.plan.interval_ms = interval.as_secs_f64() * 1000.0;
        self
    }

    /// Time-lapse interval in milliseconds.
    pub fn interval_ms(mut self, interval_ms: f64) -> Self {
        self.plan.interval_ms = interval_ms;
        self
    }

    /// Validate and return the plan.
    pub fn build(self) -> AcqResult<AcquisitionPlan> {
        self.plan.validate()?;
        Ok(self.plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_is_single_frame() {
        let plan = AcquisitionPlan::builder().build().unwrap();
        assert_eq!(plan.shape().unwrap().dims(), &[1, 1, 1]);
        assert_eq!(plan.channel_count(), 1);
    }

    #[test]
    fn test_zero_positions_rejected() {
        let err = AcquisitionPlan::builder().positions(0).build().unwrap_err();
        assert!(matches!(err, AcqError::InvalidParameters(_)));
    }

    #[test]
    fn test_negative_interval_rejected() {
        let err = AcquisitionPlan::builder()
            .interval_ms(-5.0)
            .build()
            .unwrap_err();
        assert!(err.is_pre_run());
    }

    #[test]
    fn test_unrepresentable_interval_rejected() {
        for interval_ms in [1e30, f64::INFINITY, f64::NAN] {
            let err = AcquisitionPlan::builder()
                .interval_ms(interval_ms)
                .build()
                .unwrap_err();
            assert!(matches!(err, AcqError::InvalidParameters(_)), "{}", interval_ms);
        }

        let plan = AcquisitionPlan {
            interval_ms: 1e30,
            ..Default::default()
        };
        assert_eq!(plan.interval(), Duration::MAX);
        let plan = AcquisitionPlan {
            interval_ms: f64::NAN,
            ..Default::default()
        };
        assert_eq!(plan.interval(), Duration::ZERO);
    }

    #[test]
    fn test_duplicate_channels_rejected() {
        let err = AcquisitionPlan::builder()
            .channel(ChannelSpec::new("DAPI", 10.0, 1.0))
            .channel(ChannelSpec::new("DAPI", 20.0, 1.0))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate channel"));
    }

    #[test]
    fn test_z_axis_is_innermost() {
        let plan = AcquisitionPlan::builder()
            .positions(2)
            .timepoints(3)
            .channels([
                ChannelSpec::new("DAPI", 10.0, 1.0),
                ChannelSpec::new("GFP", 20.0, 0.5),
            ])
            .z_offsets_um(vec![0.0, 5.0, 10.0])
            .build()
            .unwrap();
        assert_eq!(plan.shape().unwrap().dims(), &[2, 3, 2, 3]);
        assert_eq!(plan.axis_index(Axis::Z), Some(3));
        assert_eq!(plan.axis_index(Axis::Time), Some(1));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(
            "continuous".parse::<Strategy>().unwrap(),
            Strategy::ContinuousBuffered
        );
        assert_eq!(
            "Stepwise_Timed".parse::<Strategy>().unwrap(),
            Strategy::StepwiseTimed
        );
        assert!("burst".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_plan_from_toml() {
        let plan = AcquisitionPlan::from_toml(
            r#"
            positions = 2
            timepoints = 4
            interval_ms = 250.0
            strategy = "continuous_buffered"

            [[channels]]
            name = "Cy5"
            exposure_ms = 50.0
            "#,
        )
        .unwrap();
        assert_eq!(plan.strategy, Strategy::ContinuousBuffered);
        assert_eq!(plan.channels[0].intensity, 1.0);
        assert_eq!(plan.interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_metadata_json() {
        let plan = AcquisitionPlan::builder()
            .channels([ChannelSpec::new("DAPI", 10.0, 1.0)])
            .z_offsets_um(vec![0.0, 5.0])
            .build()
            .unwrap();
        let geometry = FrameGeometry {
            width: 8,
            height: 4,
            bytes_per_pixel: 2,
        };
        let summary: Value = serde_json::from_str(
            &plan
                .summary_metadata(geometry, PixelType::Gray16, Utc::now())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(summary["Summary"]["ChNames"], json!(["DAPI"]));
        assert_eq!(summary["Summary"]["Shape"], json!([1, 1, 1, 2]));
        assert_eq!(summary["Summary"]["PixelType"], "GRAY16");

        let mut tags = Map::new();
        tags.insert("CameraFrameIndex".into(), 7.into());
        let image: Value = serde_json::from_str(
            &plan
                .image_metadata(1, &Coordinate::new(vec![0, 0, 0, 1]), &tags, 12.5)
                .unwrap(),
        )
        .unwrap();
        assert_eq!(image["Image-index"], 1);
        assert_eq!(image["Channel"], "DAPI");
        assert_eq!(image["ZOffsetUm"], 5.0);
        assert_eq!(image["z"], 1);
        assert_eq!(image["CameraFrameIndex"], 7);
    }
}
