use std::{collections::HashMap, fmt, path::Path, time::Duration};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{AvatarError, Complexity, Result, VisemeTaxonomy};

pub mod source;

pub use source::{ClipLoader, ClipSource, ImageSequence, ImageSequenceLoader, PlaybackStatus};

/// Readiness of a declared clip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetState {
    #[default]
    Pending,
    Ready,
    Unavailable,
}

/// One recorded clip mapped to a viseme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipAsset {
    pub viseme_id: String,
    #[serde(default)]
    pub variant_index: usize,
    pub source_locator: String,
    pub duration_ms: u64,
    #[serde(skip)]
    pub state: AssetState,
}

impl ClipAsset {
    pub fn new(
        viseme_id: impl Into<String>,
        variant_index: usize,
        source_locator: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            viseme_id: viseme_id.into(),
            variant_index,
            source_locator: source_locator.into(),
            duration_ms,
            state: AssetState::Pending,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Read-only snapshot of a project's clips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipManifest {
    #[serde(default)]
    pub taxonomy: Complexity,
    pub clips: Vec<ClipAsset>,
    #[serde(default)]
    pub rest_position: Option<String>,
    #[serde(default)]
    pub background_image: Option<String>,
}

impl ClipManifest {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let manifest: Self = serde_json::from_str(&raw)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Variant indices must be unique per viseme and dense from zero.
    pub fn validate(&self) -> Result<()> {
        let mut variants: HashMap<&str, Vec<usize>> = HashMap::new();
        for clip in &self.clips {
            variants
                .entry(clip.viseme_id.as_str())
                .or_default()
                .push(clip.variant_index);
        }

        for (viseme, mut indices) in variants {
            indices.sort_unstable();
            if indices.iter().enumerate().any(|(expected, index)| expected != *index) {
                return Err(AvatarError::invalid_input(format!(
                    "variants of `{viseme}` must be numbered 0..n without gaps, got {indices:?}"
                )));
            }
        }
        Ok(())
    }
}

/// Optional still drawn behind chroma-keyed clips.
#[derive(Clone)]
pub struct BackgroundImage {
    image: RgbaImage,
}

impl BackgroundImage {
    pub fn new(image: RgbaImage) -> Self {
        Self { image }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(image::open(path.as_ref())?.to_rgba8()))
    }

    pub fn image(&self) -> &RgbaImage {
        &self.image
    }
}

impl fmt::Debug for BackgroundImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackgroundImage")
            .field("dimensions", &self.image.dimensions())
            .finish()
    }
}

/// Opaque identifier for a loaded clip owned by the [`ClipLibrary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(usize);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct PlaybackHandle {
    asset: usize,
    source: Box<dyn ClipSource>,
}

/// Owns every loaded clip for a session and indexes them by viseme.
pub struct ClipLibrary {
    taxonomy: VisemeTaxonomy,
    assets: Vec<ClipAsset>,
    handles: Vec<PlaybackHandle>,
    by_viseme: HashMap<String, Vec<HandleId>>,
    rest_locator: Option<String>,
    background: Option<BackgroundImage>,
}

impl ClipLibrary {
    /// An empty library; rest resolution yields nothing.
    pub fn empty(taxonomy: VisemeTaxonomy) -> Self {
        Self {
            taxonomy,
            assets: Vec::new(),
            handles: Vec::new(),
            by_viseme: HashMap::new(),
            rest_locator: None,
            background: None,
        }
    }

    /// Loads every declared clip. Clips that fail to decode are marked
    /// unavailable and never retried.
    pub fn preload(
        taxonomy: VisemeTaxonomy,
        manifest: &ClipManifest,
        loader: &mut dyn ClipLoader,
    ) -> Self {
        let mut library = Self::empty(taxonomy);
        library.rest_locator = manifest.rest_position.clone();

        for declared in &manifest.clips {
            let mut asset = declared.clone();
            match loader.load(&asset) {
                Ok(source) => {
                    asset.state = AssetState::Ready;
                    let id = HandleId(library.handles.len());
                    library.handles.push(PlaybackHandle {
                        asset: library.assets.len(),
                        source,
                    });
                    library
                        .by_viseme
                        .entry(asset.viseme_id.clone())
                        .or_default()
                        .push(id);
                }
                Err(err) => {
                    warn!(
                        viseme = %asset.viseme_id,
                        locator = %asset.source_locator,
                        error = %err,
                        "clip unavailable"
                    );
                    asset.state = AssetState::Unavailable;
                }
            }
            library.assets.push(asset);
        }

        let assets = &library.assets;
        let handles = &library.handles;
        for ids in library.by_viseme.values_mut() {
            ids.sort_by_key(|id| assets[handles[id.0].asset].variant_index);
        }

        info!(
            declared = manifest.clips.len(),
            ready = library.handles.len(),
            "clip library preloaded"
        );
        library
    }

    /// Viseme set the manifest was loaded against.
    pub fn taxonomy(&self) -> &VisemeTaxonomy {
        &self.taxonomy
    }

    /// Descriptors of every manifest entry, loaded or not.
    pub fn assets(&self) -> &[ClipAsset] {
        &self.assets
    }

    /// Descriptor behind a loaded handle.
    pub fn asset(&self, id: HandleId) -> Option<&ClipAsset> {
        self.handles.get(id.0).map(|h| &self.assets[h.asset])
    }

    /// True when no clip loaded successfully.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of loaded clips.
    pub fn handle_count(&self) -> usize {
        self.handles.len()
    }

    /// Ready handles for `viseme_id` ordered by variant index.
    pub fn lookup(&self, viseme_id: &str) -> &[HandleId] {
        self.by_viseme
            .get(viseme_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Explicit rest clip, then the neutral viseme's first clip, then the
    /// first loaded clip.
    pub fn resolve_rest(&self) -> Option<HandleId> {
        if let Some(rest) = &self.rest_locator {
            let explicit = (0..self.handles.len()).map(HandleId).find(|id| {
                self.asset(*id)
                    .map(|a| a.source_locator == *rest || a.source_locator.ends_with(rest.as_str()))
                    .unwrap_or(false)
            });
            if explicit.is_some() {
                return explicit;
            }
            debug!(locator = %rest, "rest clip not loaded, falling back");
        }

        if let Some(neutral) = self.taxonomy.neutral_id() {
            if let Some(id) = self.lookup(neutral).first() {
                return Some(*id);
            }
        }

        (!self.handles.is_empty()).then_some(HandleId(0))
    }

    /// Overrides the manifest's rest clip. Matched against locators by
    /// equality or suffix.
    pub fn set_rest_locator(&mut self, locator: Option<String>) {
        self.rest_locator = locator;
    }

    pub fn background(&self) -> Option<&BackgroundImage> {
        self.background.as_ref()
    }

    /// Replaces the image drawn behind keyed clips.
    pub fn set_background(&mut self, background: Option<BackgroundImage>) {
        self.background = background;
    }

    /// Resolution of the first loaded clip.
    pub fn native_resolution(&self) -> Option<(u32, u32)> {
        self.handles.first().map(|h| h.source.dimensions())
    }

    /// Starts `id` from wherever its playhead is.
    pub fn play(&mut self, id: HandleId, looping: bool) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.source.set_looping(looping);
            handle.source.play();
        }
    }

    /// Moves the playhead of `id` back to its first frame.
    pub fn rewind(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.source.rewind();
        }
    }

    pub fn set_looping(&mut self, id: HandleId, looping: bool) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.source.set_looping(looping);
        }
    }

    /// Pauses `id` and clears its loop flag.
    pub fn stop(&mut self, id: HandleId) {
        if let Some(handle) = self.handles.get_mut(id.0) {
            handle.source.pause();
            handle.source.set_looping(false);
        }
    }

    /// Unknown handles report `false`.
    pub fn is_playing(&self, id: HandleId) -> bool {
        self.handles
            .get(id.0)
            .map(|h| h.source.is_playing())
            .unwrap_or(false)
    }

    /// Clips currently advancing.
    pub fn playing_count(&self) -> usize {
        self.handles.iter().filter(|h| h.source.is_playing()).count()
    }

    /// Advances every playing clip and returns the ones that just ended.
    pub fn advance(&mut self, delta: Duration) -> Vec<HandleId> {
        self.handles
            .iter_mut()
            .enumerate()
            .filter_map(|(index, handle)| {
                (handle.source.advance(delta) == PlaybackStatus::Ended).then_some(HandleId(index))
            })
            .collect()
    }

    /// Frame under the playhead of `id`.
    pub fn frame(&self, id: HandleId) -> Option<&RgbaImage> {
        self.handles.get(id.0).map(|h| h.source.frame())
    }

    /// Stops every clip and drops all handles.
    pub fn unload(&mut self) {
        for handle in &mut self.handles {
            handle.source.pause();
        }
        self.handles.clear();
        self.by_viseme.clear();
        info!("clip library unloaded");
    }
}

impl fmt::Debug for ClipLibrary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClipLibrary")
            .field("taxonomy", &self.taxonomy.complexity())
            .field("assets", &self.assets.len())
            .field("handles", &self.handles.len())
            .field("rest_locator", &self.rest_locator)
            .field("background", &self.background)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::Rgba;

    /// Loader that fails for locators containing `broken`.
    pub(crate) fn memory_loader() -> impl FnMut(&ClipAsset) -> Result<Box<dyn ClipSource>> {
        |asset: &ClipAsset| {
            if asset.source_locator.contains("broken") {
                return Err(AvatarError::asset_load(&asset.source_locator, "decode error"));
            }
            let frame = RgbaImage::from_pixel(4, 2, Rgba([0, 0, 255, 255]));
            Ok(Box::new(ImageSequence::still(frame, asset.duration())) as Box<dyn ClipSource>)
        }
    }

    pub(crate) fn manifest(clips: &[(&str, usize, &str)]) -> ClipManifest {
        ClipManifest {
            taxonomy: Complexity::Simple,
            clips: clips
                .iter()
                .map(|(viseme, variant, locator)| ClipAsset::new(*viseme, *variant, *locator, 200))
                .collect(),
            rest_position: None,
            background_image: None,
        }
    }

    fn library(manifest: &ClipManifest) -> ClipLibrary {
        ClipLibrary::preload(VisemeTaxonomy::default(), manifest, &mut memory_loader())
    }

    #[test]
    fn lookup_orders_by_variant_and_skips_failures() {
        let lib = library(&manifest(&[
            ("Ohh", 1, "ohh-1"),
            ("Ohh", 0, "ohh-0"),
            ("Ohh", 2, "ohh-broken"),
            ("Mee", 0, "mee-0"),
        ]));

        let ohh = lib.lookup("Ohh");
        assert_eq!(ohh.len(), 2);
        assert_eq!(lib.asset(ohh[0]).unwrap().source_locator, "ohh-0");
        assert_eq!(lib.asset(ohh[1]).unwrap().source_locator, "ohh-1");
        assert!(lib.lookup("Foe").is_empty());
        assert_eq!(
            lib.assets()
                .iter()
                .filter(|a| a.state == AssetState::Unavailable)
                .count(),
            1
        );
    }

    #[test]
    fn rest_prefers_explicit_locator() {
        let mut m = manifest(&[("Ohh", 0, "clips/ohh.png"), ("Baa", 0, "clips/baa.png")]);
        m.rest_position = Some("ohh.png".to_string());
        let lib = library(&m);
        let rest = lib.resolve_rest().unwrap();
        assert_eq!(lib.asset(rest).unwrap().viseme_id, "Ohh");
    }

    #[test]
    fn rest_falls_back_to_neutral_then_first() {
        let mut m = manifest(&[("Ohh", 0, "ohh"), ("Baa", 0, "baa")]);
        m.rest_position = Some("missing".to_string());
        let lib = library(&m);
        assert_eq!(lib.asset(lib.resolve_rest().unwrap()).unwrap().viseme_id, "Baa");

        let lib = library(&manifest(&[("Ohh", 0, "ohh"), ("Mee", 0, "mee")]));
        assert_eq!(lib.asset(lib.resolve_rest().unwrap()).unwrap().viseme_id, "Ohh");

        let lib = library(&manifest(&[]));
        assert!(lib.resolve_rest().is_none());
    }

    #[test]
    fn manifest_rejects_sparse_variants() {
        assert!(manifest(&[("Ohh", 0, "a"), ("Ohh", 1, "b")]).validate().is_ok());
        assert!(manifest(&[("Ohh", 0, "a"), ("Ohh", 2, "b")]).validate().is_err());
        assert!(manifest(&[("Ohh", 0, "a"), ("Ohh", 0, "b")]).validate().is_err());
    }

    #[test]
    fn manifest_parses_camel_case_json() {
        let raw = r#"{
            "taxonomy": "detailed",
            "clips": [{ "visemeId": "V3", "variantIndex": 0, "sourceLocator": "v3.png", "durationMs": 240 }],
            "restPosition": "v2.png"
        }"#;
        let m: ClipManifest = serde_json::from_str(raw).unwrap();
        assert_eq!(m.taxonomy, Complexity::Detailed);
        assert_eq!(m.clips[0].duration(), Duration::from_millis(240));
        assert_eq!(m.clips[0].state, AssetState::Pending);
        assert_eq!(m.rest_position.as_deref(), Some("v2.png"));
    }

    #[test]
    fn stop_pauses_and_clears_loop() {
        let mut lib = library(&manifest(&[("Ohh", 0, "ohh")]));
        let id = lib.lookup("Ohh")[0];
        lib.play(id, true);
        assert_eq!(lib.playing_count(), 1);
        lib.stop(id);
        assert!(!lib.is_playing(id));
        assert_eq!(lib.native_resolution(), Some((4, 2)));
    }
}
