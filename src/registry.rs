//! Process-wide registration tables for formats and codecs.
//!
//! The registry maps magic signatures, file extensions and MIME types to
//! format ids, format ids to demuxer constructors, and codec names to
//! codec constructors. Registration is additive and is the only mutator;
//! lookups take a shared read view. The tables live for the process;
//! unregistration does not exist.
//!
//! The built-in families self-register through [`Registry::with_defaults`],
//! which also backs the lazily initialised [`Registry::global`] instance.

use std::{
    collections::HashMap,
    sync::{OnceLock, RwLock},
};

use crate::{
    codec::{self, Codec},
    config::Settings,
    demux::{self, Demuxer, StreamInfo},
    error::{Error, Result},
    pool::ChunkPool,
    probe::{format, Signature},
    source::ByteSource,
};

/// Constructs a demuxer over a byte source. Parsing has not run yet.
pub type DemuxerFactory = fn(Box<dyn ByteSource>, ChunkPool, &Settings) -> Box<dyn Demuxer>;

/// Constructs a codec for a stream. Initialisation has not run yet.
pub type CodecFactory = fn(&StreamInfo, &Settings) -> Box<dyn Codec>;

/// Tables behind the registry lock.
#[derive(Default)]
struct Tables {
    /// Kept sorted by descending priority.
    signatures: Vec<Signature>,
    extensions: HashMap<String, &'static str>,
    mime_types: HashMap<String, &'static str>,
    demuxers: HashMap<&'static str, DemuxerFactory>,
    codecs: HashMap<&'static str, CodecFactory>,
}

/// Registration tables mapping formats to demuxers and codec names to
/// codecs.
pub struct Registry {
    inner: RwLock<Tables>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Tables::default()),
        }
    }

    /// Creates a registry with every built-in demuxer and codec
    /// registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register_builtin();
        registry
    }

    /// Returns the shared process-wide registry.
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(Registry::with_defaults)
    }

    /// Registers a magic signature.
    pub fn register_signature(&self, signature: Signature) {
        if let Ok(mut tables) = self.inner.write() {
            let at = tables
                .signatures
                .partition_point(|s| s.priority >= signature.priority);
            tables.signatures.insert(at, signature);
        }
    }

    /// Registers a file-extension hint (without the dot).
    pub fn register_extension(&self, extension: &str, format: &'static str) {
        if let Ok(mut tables) = self.inner.write() {
            tables
                .extensions
                .insert(extension.to_ascii_lowercase(), format);
        }
    }

    /// Registers a MIME-type hint.
    pub fn register_mime(&self, mime: &str, format: &'static str) {
        if let Ok(mut tables) = self.inner.write() {
            tables.mime_types.insert(mime.to_ascii_lowercase(), format);
        }
    }

    /// Registers a demuxer constructor for a format id.
    pub fn register_demuxer(&self, format: &'static str, factory: DemuxerFactory) {
        if let Ok(mut tables) = self.inner.write() {
            tables.demuxers.insert(format, factory);
        }
    }

    /// Registers a codec constructor for a codec name.
    pub fn register_codec(&self, codec_name: &'static str, factory: CodecFactory) {
        if let Ok(mut tables) = self.inner.write() {
            tables.codecs.insert(codec_name, factory);
        }
    }

    /// Matches head bytes against registered signatures, best priority
    /// first.
    #[must_use]
    pub fn match_signature(&self, head: &[u8]) -> Option<String> {
        let tables = self.inner.read().ok()?;
        tables
            .signatures
            .iter()
            .find(|s| s.matches(head))
            .map(|s| s.format.to_string())
    }

    /// Looks up a format id by file extension.
    #[must_use]
    pub fn format_for_extension(&self, extension: &str) -> Option<String> {
        let tables = self.inner.read().ok()?;
        tables
            .extensions
            .get(&extension.to_ascii_lowercase())
            .map(|f| (*f).to_string())
    }

    /// Looks up a format id by MIME type.
    #[must_use]
    pub fn format_for_mime(&self, mime: &str) -> Option<String> {
        let tables = self.inner.read().ok()?;
        tables
            .mime_types
            .get(&mime.to_ascii_lowercase())
            .map(|f| (*f).to_string())
    }

    /// Constructs a demuxer for a format id.
    ///
    /// # Errors
    ///
    /// Format error when no demuxer is registered for the id.
    pub fn create_demuxer(
        &self,
        format: &str,
        source: Box<dyn ByteSource>,
        pool: ChunkPool,
        settings: &Settings,
    ) -> Result<Box<dyn Demuxer>> {
        let factory = {
            let tables = self.inner.read()?;
            tables.demuxers.get(format).copied()
        };
        factory.map_or_else(
            || Err(Error::format(format!("no demuxer registered for {format:?}"))),
            |factory| Ok(factory(source, pool, settings)),
        )
    }

    /// Constructs the codec matching a stream's codec name.
    ///
    /// # Errors
    ///
    /// Format error when no codec is registered for the name.
    pub fn create_codec(&self, info: &StreamInfo, settings: &Settings) -> Result<Box<dyn Codec>> {
        let factory = {
            let tables = self.inner.read()?;
            tables.codecs.get(info.codec_name.as_str()).copied()
        };
        factory.map_or_else(
            || {
                Err(Error::format(format!(
                    "no codec registered for {:?}",
                    info.codec_name
                )))
            },
            |factory| Ok(factory(info, settings)),
        )
    }

    /// Registers the built-in signatures, hints and factories.
    fn register_builtin(&self) {
        // Magic signatures, strongest first.
        self.register_signature(Signature::new(format::FLAC, b"fLaC", 0, 100));
        self.register_signature(Signature::new(format::OGG, b"OggS", 0, 100));
        self.register_signature(Signature::new(format::WAV, b"RIFF????WAVE", 0, 90));
        self.register_signature(Signature::new(format::MP4, b"ftyp", 4, 90));
        // ID3v2 tags prefix MPEG audio often enough to identify it.
        self.register_signature(Signature::new(format::MPEG, b"ID3", 0, 40));
        // Bare MPEG sync is only 11 bits; lowest priority.
        self.register_signature(Signature::masked(
            format::MPEG,
            &[(0xFF, 0xFF), (0xE0, 0xE0)],
            0,
            10,
        ));

        for (ext, fmt) in [
            ("flac", format::FLAC),
            ("ogg", format::OGG),
            ("oga", format::OGG),
            ("opus", format::OGG),
            ("wav", format::WAV),
            ("wave", format::WAV),
            ("mp4", format::MP4),
            ("m4a", format::MP4),
            ("mp3", format::MPEG),
            ("pcm", format::RAW),
            ("raw", format::RAW),
        ] {
            self.register_extension(ext, fmt);
        }

        for (mime, fmt) in [
            ("audio/flac", format::FLAC),
            ("audio/x-flac", format::FLAC),
            ("audio/ogg", format::OGG),
            ("application/ogg", format::OGG),
            ("audio/opus", format::OGG),
            ("audio/wav", format::WAV),
            ("audio/x-wav", format::WAV),
            ("audio/mp4", format::MP4),
            ("audio/mpeg", format::MPEG),
        ] {
            self.register_mime(mime, fmt);
        }

        self.register_demuxer(format::FLAC, |source, pool, settings| {
            Box::new(demux::flac::FlacDemuxer::new(source, pool, settings.crc_mode))
        });
        self.register_demuxer(format::OGG, |source, pool, settings| {
            Box::new(demux::ogg::OggDemuxer::new(source, pool, settings.crc_mode))
        });
        self.register_demuxer(format::WAV, |source, pool, _| {
            Box::new(demux::wav::WavDemuxer::new(source, pool))
        });
        self.register_demuxer(format::MP4, |source, pool, _| {
            Box::new(demux::mp4::Mp4Demuxer::new(source, pool))
        });
        self.register_demuxer(format::MPEG, |source, pool, _| {
            Box::new(demux::mpeg::MpegDemuxer::new(source, pool))
        });
        self.register_demuxer(format::RAW, |source, pool, _| {
            // Headerless input defaults to CD parameters; callers with
            // better knowledge construct `RawDemuxer` directly.
            Box::new(demux::raw::RawDemuxer::new(
                source,
                pool,
                StreamInfo::audio(0, "pcm_s16le", 44_100, 2, 16),
            ))
        });

        self.register_codec("flac", |info, settings| {
            Box::new(codec::flac::FlacCodec::new(info, settings.crc_mode))
        });
        self.register_codec("vorbis", |info, _| {
            Box::new(codec::vorbis::VorbisCodec::new(info))
        });
        self.register_codec("opus", |info, _| Box::new(codec::opus::OpusCodec::new(info)));
        self.register_codec("mp3", |info, _| Box::new(codec::mp3::Mp3Codec::new(info)));
        for &name in codec::pcm::CODEC_NAMES {
            self.register_codec(name, |info, _| Box::new(codec::pcm::PcmCodec::new(info)));
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
