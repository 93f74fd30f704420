//! Command dispatch over one reduction session.
//!
//! A [`Session`] owns the mapper, the orientation, the shared histogram and
//! the worker pool. Every [`Command`] yields either a [`CommandOutcome`]
//! with a typed [`Reply`] and a status line, or a [`CommandError`]; a
//! failed command leaves the previous state in place.

use crate::pipeline::map_on_pool;
use crate::pool::{WorkerPool, WorkerPoolConfig};
use crate::reader::EventFileReader;
use crate::receiver::ReceiverMessage;
use crate::{Error, Result};
use qspace_core::{Mat3, OrientationMatrix, Peak, QEvent, RawEventBatch, Vec3};
use qspace_histogram::{
    AllocationRetry, GridShape, Histogram3D, HistogramConfig, HistogramLayout, IntegratedPeak, IntegrationConfig,
    IntegrationStats, PeakFinder, PeakSearchConfig, SharedHistogram, SphereIntegrator,
};
use qspace_mapping::{
    Centering, DetectorCoverage, FullCoverage, InstrumentConfig, MapStats, OrientationIndexer,
    PointInfo, QMapper,
};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error as ThisError;

/// A request to the session.
#[derive(Clone, Debug)]
pub enum Command {
    /// Reads `count` events starting at `first` from an event file.
    /// `threads` resizes the worker pool.
    LoadEvents {
        /// Event file.
        path: PathBuf,
        /// First event to read.
        first: usize,
        /// Events to read; clamped to the file.
        count: usize,
        /// Worker count for later mapping.
        threads: Option<usize>,
    },
    /// Sets up the mapper for an instrument.
    InitInstrument(Box<InstrumentConfig>),
    /// Allocates the histogram, or moves the existing one.
    InitHistogram(HistogramLayout),
    /// Adds events already in Q.
    AddEventsToHistogram {
        /// Events to add.
        events: Vec<QEvent>,
        /// Add each event's weight instead of one.
        use_weights: bool,
    },
    /// Maps raw events and adds them. `None` uses the loaded events.
    MapAndAddEvents(Option<RawEventBatch>),
    /// Searches the histogram for peaks.
    FindPeaks(PeakSearchConfig),
    /// Integrates peaks; `None` uses the last peaks found.
    SphereIntegrate {
        /// Peaks to integrate.
        peaks: Option<Vec<Peak>>,
        /// Peak sphere radius in Å⁻¹.
        radius: f64,
    },
    /// Replaces the orientation matrix (columns a*, b*, c*, 2π included).
    SetOrientationMatrix(Mat3),
    /// Indexes the last peaks found.
    IndexPeaks {
        /// Largest accepted distance from an integer index.
        tolerance: f64,
    },
    /// Lists reflections the detectors can observe.
    PredictPeaks {
        /// Smallest |Q|.
        min_q: f64,
        /// Largest |Q|.
        max_q: f64,
        /// Reflection condition.
        centering: Centering,
    },
    /// Describes a point in Q.
    SelectPoint(Vec3),
    /// Zeroes the histogram.
    ClearHistogram,
    /// Largest bin value.
    GetHistogramMax,
}

impl Command {
    /// Command name for status lines.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Command::LoadEvents { .. } => "LoadEvents",
            Command::InitInstrument(_) => "InitInstrument",
            Command::InitHistogram(_) => "InitHistogram",
            Command::AddEventsToHistogram { .. } => "AddEventsToHistogram",
            Command::MapAndAddEvents(_) => "MapAndAddEvents",
            Command::FindPeaks(_) => "FindPeaks",
            Command::SphereIntegrate { .. } => "SphereIntegrate",
            Command::SetOrientationMatrix(_) => "SetOrientationMatrix",
            Command::IndexPeaks { .. } => "IndexPeaks",
            Command::PredictPeaks { .. } => "PredictPeaks",
            Command::SelectPoint(_) => "SelectPoint",
            Command::ClearHistogram => "ClearHistogram",
            Command::GetHistogramMax => "GetHistogramMax",
        }
    }
}

/// Typed result of a command.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Events read from a file.
    EventsLoaded {
        /// Events read.
        count: usize,
        /// Events in the file.
        file_events: usize,
        /// Segments the window was decoded in.
        segments: usize,
    },
    /// Mapper ready.
    InstrumentReady {
        /// Instrument name.
        name: String,
        /// Detector panels.
        detectors: usize,
    },
    /// Histogram allocated.
    HistogramReady {
        /// Bins actually allocated.
        shape: GridShape,
        /// Allocation retries needed.
        retries: usize,
    },
    /// Events added.
    EventsAdded {
        /// Weight added by this call.
        added: f64,
        /// Events binned since the last clear.
        num_added: u64,
    },
    /// Raw events mapped and added.
    EventsMapped {
        /// Mapping counters.
        stats: MapStats,
        /// Weight added to the histogram.
        added: f64,
        /// Worker failure or timeout, when only part of the batch was mapped.
        failure: Option<String>,
    },
    /// Peaks found, by descending intensity.
    Peaks(Vec<Peak>),
    /// Integration results.
    Integrated {
        /// Per-peak results.
        peaks: Vec<IntegratedPeak>,
        /// Summary counts.
        stats: IntegrationStats,
    },
    /// Orientation accepted.
    OrientationSet(OrientationMatrix),
    /// Peaks after indexing.
    Indexed {
        /// Peaks given an index.
        indexed: usize,
        /// All peaks.
        peaks: Vec<Peak>,
    },
    /// Predicted reflections.
    Predicted(Vec<Peak>),
    /// Point description.
    Point {
        /// Geometry of the point.
        info: PointInfo,
        /// Fractional Miller indices, if oriented.
        hkl: Option<Vec3>,
        /// Histogram value, if the point is on the grid.
        value: Option<f32>,
    },
    /// Histogram zeroed.
    Cleared,
    /// Largest bin value.
    HistogramMax(f32),
    /// Protons-on-target total received.
    ScaleFactor(f64),
}

/// A successful command.
#[derive(Clone, Debug, PartialEq)]
pub struct CommandOutcome {
    /// Typed result.
    pub reply: Reply,
    /// Human-readable summary.
    pub status: String,
}

impl CommandOutcome {
    fn new(reply: Reply, status: impl Into<String>) -> Self {
        Self {
            reply,
            status: status.into(),
        }
    }
}

/// A failed command.
#[derive(Debug, ThisError)]
#[error("{command} failed: {source}")]
pub struct CommandError {
    /// Name of the failed command.
    pub command: &'static str,
    /// Cause.
    #[source]
    pub source: Error,
}

/// Reduction state driven by [`Command`]s.
#[derive(Debug)]
pub struct Session {
    mapper: Option<Arc<QMapper>>,
    indexer: OrientationIndexer,
    histogram: Option<SharedHistogram>,
    pool: WorkerPool,
    histogram_config: HistogramConfig,
    integrator: SphereIntegrator,
    loaded: RawEventBatch,
    peaks: Vec<Peak>,
    protons_on_target: f64,
}

impl Session {
    /// Creates a session with no instrument or histogram.
    ///
    /// # Errors
    /// Returns an error if the worker pool cannot be started.
    pub fn new(
        pool: WorkerPoolConfig,
        histogram: HistogramConfig,
        integration: IntegrationConfig,
    ) -> Result<Self> {
        Ok(Self {
            mapper: None,
            indexer: OrientationIndexer::new(),
            histogram: None,
            pool: WorkerPool::new(pool)?,
            histogram_config: histogram,
            integrator: SphereIntegrator::new(integration),
            loaded: RawEventBatch::default(),
            peaks: Vec::new(),
            protons_on_target: 0.0,
        })
    }

    /// Creates a session with default settings.
    ///
    /// # Errors
    /// Returns an error if the worker pool cannot be started.
    pub fn with_defaults() -> Result<Self> {
        Self::new(
            WorkerPoolConfig::default(),
            HistogramConfig::default(),
            IntegrationConfig::default(),
        )
    }

    /// Mapper built by the last [`Command::InitInstrument`].
    #[must_use]
    pub fn mapper(&self) -> Option<&Arc<QMapper>> {
        self.mapper.as_ref()
    }

    /// The shared histogram, once allocated.
    #[must_use]
    pub fn histogram(&self) -> Option<&SharedHistogram> {
        self.histogram.as_ref()
    }

    /// The accepted orientation matrix.
    #[must_use]
    pub fn orientation(&self) -> Option<&OrientationMatrix> {
        self.indexer.matrix()
    }

    /// Peaks from the last search, indexed if [`Command::IndexPeaks`] ran.
    #[must_use]
    pub fn peaks(&self) -> &[Peak] {
        &self.peaks
    }

    /// Events from the last file load.
    #[must_use]
    pub fn loaded_events(&self) -> &RawEventBatch {
        &self.loaded
    }

    /// Protons on target reported by ingested scale factor messages.
    #[must_use]
    pub fn protons_on_target(&self) -> f64 {
        self.protons_on_target
    }

    /// The worker pool commands run on.
    #[must_use]
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Runs one command.
    ///
    /// # Errors
    /// Returns a [`CommandError`] naming the command and its cause.
    pub fn execute(&mut self, command: Command) -> std::result::Result<CommandOutcome, CommandError> {
        let name = command.name();
        match self.dispatch(command) {
            Ok(outcome) => {
                log::info!("{name}: {}", outcome.status);
                Ok(outcome)
            }
            Err(source) => {
                log::warn!("{name} failed: {source}");
                Err(CommandError {
                    command: name,
                    source,
                })
            }
        }
    }

    /// Feeds a message from the UDP receiver into the session.
    ///
    /// # Errors
    /// See [`Session::execute`].
    pub fn ingest(&mut self, message: ReceiverMessage) -> std::result::Result<CommandOutcome, CommandError> {
        match message {
            ReceiverMessage::Raw(batch) => self.execute(Command::MapAndAddEvents(Some(batch))),
            ReceiverMessage::Mapped(events) => self.execute(Command::AddEventsToHistogram {
                events,
                use_weights: true,
            }),
            ReceiverMessage::ScaleFactor { protons_on_target } => {
                self.protons_on_target = protons_on_target;
                Ok(CommandOutcome::new(
                    Reply::ScaleFactor(protons_on_target),
                    format!("protons on target: {protons_on_target:.4e}"),
                ))
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<CommandOutcome> {
        match command {
            Command::LoadEvents {
                path,
                first,
                count,
                threads,
            } => self.load_events(path, first, count, threads),
            Command::InitInstrument(config) => {
                let mapper = QMapper::new(&config)?;
                self.mapper = Some(Arc::new(mapper));
                let detectors = config.geometry.panels().len();
                Ok(CommandOutcome::new(
                    Reply::InstrumentReady {
                        name: config.name.clone(),
                        detectors,
                    },
                    format!("instrument {} with {detectors} detectors", config.name),
                ))
            }
            Command::InitHistogram(layout) => self.init_histogram(&layout),
            Command::AddEventsToHistogram { events, use_weights } => {
                let histogram = self.require_histogram()?;
                let added = histogram.add_events(&events, use_weights);
                let num_added = histogram.lock().num_added();
                Ok(CommandOutcome::new(
                    Reply::EventsAdded { added, num_added },
                    format!("added {} events (weight {added})", events.len()),
                ))
            }
            Command::MapAndAddEvents(batch) => self.map_and_add(batch),
            Command::FindPeaks(config) => {
                let result = {
                    let histogram = self.require_histogram()?.lock();
                    PeakFinder::new(config).find_peaks(&histogram)
                };
                self.peaks.clone_from(&result.peaks);
                Ok(CommandOutcome::new(Reply::Peaks(result.peaks), result.status))
            }
            Command::SphereIntegrate { peaks, radius } => {
                let peaks = peaks.unwrap_or_else(|| self.peaks.clone());
                let integrated = {
                    let histogram = self.require_histogram()?.lock();
                    self.integrator.integrate_peaks(&histogram, &peaks, radius)?
                };
                let stats = IntegrationStats::from_peaks(&integrated);
                Ok(CommandOutcome::new(
                    Reply::Integrated {
                        peaks: integrated,
                        stats,
                    },
                    stats.to_string(),
                ))
            }
            Command::SetOrientationMatrix(ub) => {
                let matrix = *self.indexer.set_matrix(ub)?;
                Ok(CommandOutcome::new(
                    Reply::OrientationSet(matrix),
                    "orientation matrix set",
                ))
            }
            Command::IndexPeaks { tolerance } => {
                let indexed = self.indexer.index_peaks(&mut self.peaks, tolerance)?;
                Ok(CommandOutcome::new(
                    Reply::Indexed {
                        indexed,
                        peaks: self.peaks.clone(),
                    },
                    format!("indexed {indexed} of {} peaks", self.peaks.len()),
                ))
            }
            Command::PredictPeaks {
                min_q,
                max_q,
                centering,
            } => {
                let coverage: &dyn DetectorCoverage = match &self.mapper {
                    Some(mapper) => &**mapper,
                    None => &FullCoverage,
                };
                let peaks = self.indexer.predicted_peaks(min_q, max_q, centering, coverage)?;
                let status = format!("{} reflections predicted", peaks.len());
                Ok(CommandOutcome::new(Reply::Predicted(peaks), status))
            }
            Command::SelectPoint(q) => {
                let mapper = self.mapper.as_ref().ok_or(Error::NotReady("instrument"))?;
                let info = mapper.point_info(q);
                let hkl = self.indexer.matrix().map(|m| m.hkl_of(q));
                let value = self.histogram.as_ref().and_then(|h| h.lock().value_at(q));
                let status = match info.d_spacing {
                    Some(d) => format!("|Q| = {:.4}, d = {d:.4}", info.mag_q),
                    None => format!("|Q| = {:.4}", info.mag_q),
                };
                Ok(CommandOutcome::new(Reply::Point { info, hkl, value }, status))
            }
            Command::ClearHistogram => {
                self.require_histogram()?.clear();
                Ok(CommandOutcome::new(Reply::Cleared, "histogram cleared"))
            }
            Command::GetHistogramMax => {
                let max = self.require_histogram()?.max_value();
                Ok(CommandOutcome::new(Reply::HistogramMax(max), format!("max {max}")))
            }
        }
    }

    fn require_histogram(&self) -> Result<&SharedHistogram> {
        self.histogram.as_ref().ok_or(Error::NotReady("histogram"))
    }

    fn load_events(
        &mut self,
        path: PathBuf,
        first: usize,
        count: usize,
        threads: Option<usize>,
    ) -> Result<CommandOutcome> {
        let reader = EventFileReader::open(&path)?;
        if let Some(workers) = threads.filter(|&w| w != self.pool.config().workers) {
            let config = self.pool.config().clone().with_workers(workers);
            self.pool = WorkerPool::new(config)?;
        }
        let window = reader.window(first, count);
        let max_segment_size = self.pool.config().max_segment_size;
        let parts = self
            .pool
            .install(|| reader.read_segments(first, count, max_segment_size));
        let mut loaded = RawEventBatch::with_capacity(window.len());
        for part in &parts {
            loaded.append(part);
        }
        self.loaded = loaded;
        Ok(CommandOutcome::new(
            Reply::EventsLoaded {
                count: self.loaded.len(),
                file_events: reader.event_count(),
                segments: parts.len(),
            },
            format!(
                "loaded events [{}, {}) of {} from {} in {} segments",
                window.start,
                window.end,
                reader.event_count(),
                path.display(),
                parts.len()
            ),
        ))
    }

    fn init_histogram(&mut self, layout: &HistogramLayout) -> Result<CommandOutcome> {
        let mut retries = 0;
        let mut on_retry = |_: &AllocationRetry| retries += 1;
        let shape = match &self.histogram {
            Some(shared) => {
                let mut histogram = shared.lock();
                histogram.set_position(layout.edge_binners()?, &self.histogram_config.memory, &mut on_retry)?;
                histogram.shape()
            }
            None => {
                let histogram = Histogram3D::from_layout(layout, &self.histogram_config, &mut on_retry)?;
                let shape = histogram.shape();
                self.histogram = Some(SharedHistogram::new(histogram));
                shape
            }
        };
        let mut status = format!("histogram {shape} bins");
        if retries > 0 {
            status.push_str(&format!(" after {retries} allocation retries"));
        }
        Ok(CommandOutcome::new(Reply::HistogramReady { shape, retries }, status))
    }

    fn map_and_add(&self, batch: Option<RawEventBatch>) -> Result<CommandOutcome> {
        let mapper = self.mapper.as_ref().ok_or(Error::NotReady("instrument"))?;
        let histogram = self.require_histogram()?;
        let batch = batch.as_ref().unwrap_or(&self.loaded);
        let mapped = map_on_pool(&self.pool, mapper, batch);
        let added = histogram.add_events(&mapped.events, true);
        let failure = mapped.error().map(|e| e.to_string());
        let mut status = format!(
            "mapped {} of {} events ({} unmatched, {} masked, {} filtered)",
            mapped.stats.mapped,
            batch.len(),
            mapped.stats.unmatched,
            mapped.stats.masked,
            mapped.stats.filtered
        );
        if let Some(failure) = &failure {
            status.push_str(&format!("; partial batch: {failure}"));
        }
        Ok(CommandOutcome::new(
            Reply::EventsMapped {
                stats: mapped.stats,
                added,
                failure,
            },
            status,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use qspace_core::Hkl;

    const PEAK: Vec3 = Vec3::new(-1.05, 0.5, 0.1);

    fn session_with_histogram() -> Session {
        let mut session = Session::with_defaults().unwrap();
        session
            .execute(Command::InitHistogram(HistogramLayout::Cartesian {
                max_q: 2.0,
                bins: 20,
            }))
            .unwrap();
        session
    }

    #[test]
    fn test_commands_need_histogram() {
        let mut session = Session::with_defaults().unwrap();
        let err = session.execute(Command::GetHistogramMax).unwrap_err();
        assert_eq!(err.command, "GetHistogramMax");
        assert!(matches!(err.source, Error::NotReady("histogram")));
        assert!(session.execute(Command::MapAndAddEvents(None)).is_err());
        assert!(session.execute(Command::SelectPoint(PEAK)).is_err());
    }

    #[test]
    fn test_find_integrate_index() {
        let mut session = session_with_histogram();
        let events = vec![QEvent::from_q(PEAK); 50];
        let added = session
            .execute(Command::AddEventsToHistogram {
                events,
                use_weights: true,
            })
            .unwrap();
        assert_eq!(
            added.reply,
            Reply::EventsAdded {
                added: 50.0,
                num_added: 50
            }
        );
        let max = session.execute(Command::GetHistogramMax).unwrap();
        assert_eq!(max.reply, Reply::HistogramMax(50.0));

        let found = session
            .execute(Command::FindPeaks(PeakSearchConfig::default()))
            .unwrap();
        let Reply::Peaks(peaks) = found.reply else {
            panic!("unexpected reply");
        };
        assert_eq!(peaks.len(), 1);
        assert_relative_eq!(peaks[0].intensity, 50.0);
        assert_relative_eq!(peaks[0].position().x, PEAK.x, epsilon = 1e-9);
        assert_relative_eq!(peaks[0].position().y, PEAK.y, epsilon = 1e-9);
        assert_relative_eq!(peaks[0].position().z, PEAK.z, epsilon = 1e-9);

        let integrated = session
            .execute(Command::SphereIntegrate {
                peaks: None,
                radius: 0.15,
            })
            .unwrap();
        let Reply::Integrated { peaks, stats } = integrated.reply else {
            panic!("unexpected reply");
        };
        let result = peaks[0].result.unwrap();
        assert_relative_eq!(result.net_intensity, 50.0, epsilon = 1e-9);
        assert_relative_eq!(result.sigma, 50f64.sqrt(), epsilon = 1e-9);
        assert_eq!(stats.above_i_over_sigma, [1, 1, 1, 0]);

        let ub = Mat3::from_columns(PEAK, Vec3::Z, Vec3::Y);
        session.execute(Command::SetOrientationMatrix(ub)).unwrap();
        let indexed = session
            .execute(Command::IndexPeaks { tolerance: 0.1 })
            .unwrap();
        assert!(matches!(indexed.reply, Reply::Indexed { indexed: 1, .. }));
        assert_eq!(session.peaks()[0].hkl, Some(Hkl::new(1, 0, 0)));

        let predicted = session
            .execute(Command::PredictPeaks {
                min_q: 0.0,
                max_q: 1.2,
                centering: Centering::P,
            })
            .unwrap();
        let Reply::Predicted(predicted) = predicted.reply else {
            panic!("unexpected reply");
        };
        assert!(predicted.iter().any(|p| p.hkl == Some(Hkl::new(1, 0, 0))));
        assert!(predicted.iter().all(|p| p.position().length() <= 1.2));

        session.execute(Command::ClearHistogram).unwrap();
        let max = session.execute(Command::GetHistogramMax).unwrap();
        assert_eq!(max.reply, Reply::HistogramMax(0.0));
    }

    #[test]
    fn test_singular_orientation_keeps_previous() {
        let mut session = Session::with_defaults().unwrap();
        let good = Mat3::from_columns(Vec3::X, Vec3::Y, Vec3::Z);
        session.execute(Command::SetOrientationMatrix(good)).unwrap();
        let singular = Mat3::from_columns(Vec3::X, Vec3::X, Vec3::Z);
        let err = session
            .execute(Command::SetOrientationMatrix(singular))
            .unwrap_err();
        assert_eq!(err.command, "SetOrientationMatrix");
        assert_eq!(session.orientation().unwrap().ub(), &good);
    }

    #[test]
    fn test_reinit_histogram_keeps_shared_handle() {
        let mut session = session_with_histogram();
        let handle = session.histogram().unwrap().clone();
        handle.add_events(&[QEvent::from_q(PEAK)], true);
        let outcome = session
            .execute(Command::InitHistogram(HistogramLayout::Cartesian {
                max_q: 3.0,
                bins: 10,
            }))
            .unwrap();
        assert_eq!(
            outcome.reply,
            Reply::HistogramReady {
                shape: GridShape::new(10, 10, 10),
                retries: 0
            }
        );
        assert_eq!(handle.lock().shape(), GridShape::new(10, 10, 10));
        assert_eq!(handle.lock().num_added(), 0);
    }

    #[test]
    fn test_ingest_messages() {
        let mut session = session_with_histogram();
        let outcome = session
            .ingest(ReceiverMessage::Mapped(vec![QEvent::from_q(PEAK); 3]))
            .unwrap();
        assert!(matches!(outcome.reply, Reply::EventsAdded { num_added: 3, .. }));
        session
            .ingest(ReceiverMessage::ScaleFactor {
                protons_on_target: 2.5e12,
            })
            .unwrap();
        assert_relative_eq!(session.protons_on_target(), 2.5e12);
        // Raw events need an instrument.
        assert!(session
            .ingest(ReceiverMessage::Raw(RawEventBatch::default()))
            .is_err());
    }
}
