//! Tiled upscale orchestration.
//!
//! Drives the tile planner over the source image, runs each tile through
//! the inference seam on a blocking thread, and composites decoded tiles
//! into the destination sink at scaled coordinates. Tiles are processed
//! strictly sequentially: tile N is fully written before tile N+1 is
//! encoded, and the sink has exactly one writer.

use std::sync::Arc;

use tracing::debug;

use crate::codec::{decode_tensor, encode_tile};
use crate::error::{Result, UpscaleError};
use crate::pixels::{PixelBuffer, PixelRegionSink, PixelRegionSource};
use crate::session::{SessionManager, SessionOptions, TileInference};
use crate::tile::TilePlan;

pub const MIN_TILE_SIZE: u32 = 64;
pub const MAX_TILE_SIZE: u32 = 512;
pub const MAX_OVERLAP: u32 = 32;
pub const DEFAULT_TILE_SIZE: u32 = 128;
pub const DEFAULT_OVERLAP: u32 = 8;

/// Extra scheduler yield cadence, in completed tiles.
const YIELD_INTERVAL_TILES: usize = 2;

/// Caller-facing tuning knobs for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpscaleOptions {
    pub tile_size: u32,
    /// Accepted for forward compatibility. Does not alter tile placement
    /// and no seam blending is performed.
    pub overlap: u32,
}

impl Default for UpscaleOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

impl UpscaleOptions {
    /// Bound tile size to [64, 512] and overlap to [0, 32].
    pub fn clamped(self) -> Self {
        Self {
            tile_size: self.tile_size.clamp(MIN_TILE_SIZE, MAX_TILE_SIZE),
            overlap: self.overlap.min(MAX_OVERLAP),
        }
    }
}

/// Progress notifications emitted once per completed tile plus a terminal
/// event on normal completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    TileCompleted { completed: usize, total: usize },
    Done { total: usize },
}

pub type ProgressCallback<'a> = dyn FnMut(ProgressEvent) + Send + 'a;

/// Transient state of one run, returned as the run summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpscaleJob {
    pub source_width: u32,
    pub source_height: u32,
    pub tile_size: u32,
    pub overlap: u32,
    pub scale: u32,
    pub total_tiles: usize,
    pub completed_tiles: usize,
}

/// Run a full tiled upscale of `source` into `dest`.
///
/// The destination is resized to source dimensions × scale factor, then
/// each planned tile is encoded, inferred, decoded, and written at
/// `(tile.x * scale, tile.y * scale)`. The task yields to the scheduler
/// before every inference call and again every second completed tile.
///
/// The first failing tile aborts the whole job; tiles already written
/// remain in the sink. There is no mid-job cancellation.
pub async fn run_upscale<I, Src, Snk>(
    session: Arc<I>,
    source: &Src,
    dest: &mut Snk,
    options: UpscaleOptions,
    mut progress: Option<&mut ProgressCallback<'_>>,
) -> Result<UpscaleJob>
where
    I: TileInference,
    Src: PixelRegionSource,
    Snk: PixelRegionSink,
{
    let options = options.clamped();
    let scale = session.scale();
    let source_width = source.width();
    let source_height = source.height();

    let out_width = source_width * scale;
    let out_height = source_height * scale;
    dest.resize(out_width, out_height);

    let plan = TilePlan::new(source_width, source_height, options.tile_size);
    let mut job = UpscaleJob {
        source_width,
        source_height,
        tile_size: options.tile_size,
        overlap: options.overlap,
        scale,
        total_tiles: plan.tile_count(),
        completed_tiles: 0,
    };

    debug!(
        source_width,
        source_height,
        out_width,
        out_height,
        tile_size = options.tile_size,
        overlap = options.overlap,
        total_tiles = job.total_tiles,
        "Starting tiled upscale"
    );

    for tile in plan {
        let region = source.read_region(tile.x, tile.y, tile.width, tile.height);
        let input = encode_tile(&region);

        // Fairness point: let the host run before each inference call.
        tokio::task::yield_now().await;

        let tile_session = session.clone();
        let output = tokio::task::spawn_blocking(move || tile_session.run(tile, input))
            .await
            .map_err(|join_error| UpscaleError::InferenceFailed {
                x: tile.x,
                y: tile.y,
                cause: format!("inference task failed: {join_error}"),
            })??;

        let pixels = decode_tensor(&output)?;
        dest.write_region(tile.x * scale, tile.y * scale, &pixels);

        job.completed_tiles += 1;
        if let Some(callback) = progress.as_mut() {
            callback(ProgressEvent::TileCompleted {
                completed: job.completed_tiles,
                total: job.total_tiles,
            });
        }

        // Bound a scheduling slice even when inference returns quickly.
        if job.completed_tiles % YIELD_INTERVAL_TILES == 0 {
            tokio::task::yield_now().await;
        }
    }

    if let Some(callback) = progress.as_mut() {
        callback(ProgressEvent::Done {
            total: job.total_tiles,
        });
    }

    debug!(total_tiles = job.total_tiles, "Tiled upscale complete");
    Ok(job)
}

/// Job context tying together the session manager and the retained
/// source image across runs.
///
/// The session is created on first upscale, reused afterwards, and
/// invalidated only by [`Upscaler::reset_session`].
pub struct Upscaler {
    sessions: SessionManager,
    source: Option<PixelBuffer>,
}

impl Upscaler {
    pub fn new(options: SessionOptions) -> Self {
        Self {
            sessions: SessionManager::new(options),
            source: None,
        }
    }

    pub fn set_source(&mut self, image: PixelBuffer) {
        self.source = Some(image);
    }

    pub fn source(&self) -> Option<&PixelBuffer> {
        self.source.as_ref()
    }

    pub fn clear_source(&mut self) {
        self.source = None;
    }

    pub fn reset_session(&self) {
        self.sessions.reset();
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.sessions
    }

    /// Upscale the retained source image into a fresh buffer.
    ///
    /// Rejected with [`UpscaleError::NoSourceImage`] before any work —
    /// including session creation — when no image has been supplied.
    pub async fn upscale(
        &self,
        options: UpscaleOptions,
        progress: Option<&mut ProgressCallback<'_>>,
    ) -> Result<(PixelBuffer, UpscaleJob)> {
        let source = self.source.as_ref().ok_or(UpscaleError::NoSourceImage)?;
        let session = self.sessions.session().await?;

        let mut dest = PixelBuffer::new(0, 0);
        let job = run_upscale(session, source, &mut dest, options, progress).await?;
        Ok((dest, job))
    }
}
