//! Input record streams and per-category output sinks.
//!
//! Input is FASTA or FASTQ, plain or gzip; the format is sniffed from the
//! first byte so piped and misnamed files still work. Output sinks are one
//! writer per category file, so the bytes of one read are never interleaved
//! with another's.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read as IoRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use seq_io::fasta;
use seq_io::fasta::Record as FastaRecord;
use seq_io::fastq;
use seq_io::fastq::Record as FastqRecord;

use crate::results::Category;

// ------------------------------
// Records
// ------------------------------

/// One sequencing read, format-agnostic. `head` is the full header line
/// without the leading marker; `qual` is opaque to the classifier.
#[derive(Debug, Clone)]
pub struct ReadRecord {
    pub head: String,
    pub seq: Vec<u8>,
    pub qual: Option<Vec<u8>>,
}

impl ReadRecord {
    /// The id token: the header up to the first whitespace.
    pub fn id(&self) -> &str {
        self.head
            .split_whitespace()
            .next()
            .unwrap_or(self.head.as_str())
    }

    /// Mate-shared prefix: the id up to the last `/`, or the whole id.
    pub fn pair_prefix(&self) -> &str {
        let id = self.id();
        match id.rfind('/') {
            Some(pos) => &id[..pos],
            None => id,
        }
    }

    /// Mate number from a trailing `/1` or `/2`.
    pub fn mate_num(&self) -> Option<u8> {
        let id = self.id();
        match id.rfind('/') {
            Some(pos) => match &id[pos + 1..] {
                "1" => Some(1),
                "2" => Some(2),
                _ => None,
            },
            None => None,
        }
    }

    /// Illumina chastity marker in the header comment.
    pub fn is_unchaste(&self) -> bool {
        self.head.contains(":Y:")
    }
}

// ------------------------------
// Input streams
// ------------------------------

type BoxedRead = Box<dyn IoRead + Send>;

enum FormatReader {
    Fasta(fasta::Reader<BufReader<BoxedRead>>),
    Fastq(fastq::Reader<BufReader<BoxedRead>>),
}

pub struct RecordStream {
    inner: FormatReader,
    path: PathBuf,
}

/// Open a sequence file, transparently decoding gzip.
fn open_raw(path: &Path) -> Result<BoxedRead> {
    let file = File::open(path).with_context(|| format!("open {:?}", path))?;
    // larger buffer for better I/O throughput
    let buffered = BufReader::with_capacity(512 * 1024, file);
    let is_gz = path.to_str().map(|s| s.ends_with(".gz")).unwrap_or(false);
    Ok(if is_gz {
        Box::new(MultiGzDecoder::new(buffered))
    } else {
        Box::new(buffered)
    })
}

impl RecordStream {
    pub fn open(path: &Path) -> Result<Self> {
        let raw = open_raw(path)?;
        let mut buffered = BufReader::new(raw);
        let first = buffered.fill_buf()?.first().copied();
        let inner = match first {
            Some(b'>') => FormatReader::Fasta(fasta::Reader::new(buffered)),
            Some(b'@') => FormatReader::Fastq(fastq::Reader::new(buffered)),
            Some(other) => bail!(
                "{:?} does not look like FASTA or FASTQ (starts with {:?})",
                path,
                other as char
            ),
            // empty input is a valid (zero-read) FASTA stream
            None => FormatReader::Fasta(fasta::Reader::new(buffered)),
        };
        Ok(RecordStream {
            inner,
            path: path.to_path_buf(),
        })
    }

    pub fn next_record(&mut self) -> Result<Option<ReadRecord>> {
        match &mut self.inner {
            FormatReader::Fasta(reader) => match reader.next() {
                None => Ok(None),
                Some(rec) => {
                    let rec = rec.with_context(|| format!("read {:?}", self.path))?;
                    Ok(Some(ReadRecord {
                        head: String::from_utf8_lossy(rec.head()).into_owned(),
                        seq: rec.full_seq().into_owned(),
                        qual: None,
                    }))
                }
            },
            FormatReader::Fastq(reader) => match reader.next() {
                None => Ok(None),
                Some(rec) => {
                    let rec = rec.with_context(|| format!("read {:?}", self.path))?;
                    Ok(Some(ReadRecord {
                        head: String::from_utf8_lossy(rec.head()).into_owned(),
                        seq: rec.seq().to_vec(),
                        qual: Some(rec.qual().to_vec()),
                    }))
                }
            },
        }
    }
}

// ------------------------------
// Output sinks
// ------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Fasta,
    Fastq,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Fasta => "fa",
            OutputFormat::Fastq => "fq",
        }
    }
}

/// Format one record. With `-w` the winning score rides in the id.
pub fn write_formatted<W: Write>(
    w: &mut W,
    format: OutputFormat,
    rec: &ReadRecord,
    score: Option<f64>,
) -> std::io::Result<()> {
    let marker: &[u8] = match format {
        OutputFormat::Fasta => b">",
        OutputFormat::Fastq => b"@",
    };
    w.write_all(marker)?;
    w.write_all(rec.head.as_bytes())?;
    if let Some(score) = score {
        write!(w, " {}", score)?;
    }
    w.write_all(b"\n")?;
    w.write_all(&rec.seq)?;
    w.write_all(b"\n")?;
    if format == OutputFormat::Fastq {
        w.write_all(b"+\n")?;
        match &rec.qual {
            Some(qual) => w.write_all(qual)?,
            // FASTA input routed into FASTQ output has no qualities
            None => w.write_all(&vec![b'I'; rec.seq.len()])?,
        }
        w.write_all(b"\n")?;
    }
    Ok(())
}

pub struct ReadSink {
    w: BufWriter<Box<dyn Write + Send>>,
    format: OutputFormat,
}

impl ReadSink {
    pub fn create(path: &Path, format: OutputFormat, gzip: bool) -> Result<Self> {
        let file = File::create(path).with_context(|| format!("create {:?}", path))?;
        let w: Box<dyn Write + Send> = if gzip {
            Box::new(GzEncoder::new(file, Compression::default()))
        } else {
            Box::new(file)
        };
        Ok(ReadSink {
            w: BufWriter::new(w),
            format,
        })
    }

    pub fn write_record(&mut self, rec: &ReadRecord, score: Option<f64>) -> std::io::Result<()> {
        write_formatted(&mut self.w, self.format, rec, score)
    }

    fn finish(&mut self) -> Result<()> {
        // the gz trailer is written when the encoder drops
        self.w.flush()?;
        Ok(())
    }
}

/// One sink per category (every filter id, `multiMatch`, `noMatch`);
/// paired mode keeps a `_1`/`_2` sink pair per category.
pub enum SinkSet {
    Single(Vec<ReadSink>),
    Paired(Vec<(ReadSink, ReadSink)>),
}

/// Sink slot for a category: filters first, then `multiMatch`, `noMatch`.
#[inline]
fn sink_index(category: Category, num_filters: usize) -> usize {
    match category {
        Category::Filter(i) => i,
        Category::MultiMatch => num_filters,
        Category::NoMatch => num_filters + 1,
    }
}

impl SinkSet {
    pub fn create(
        prefix: &str,
        labels: &[&str],
        format: OutputFormat,
        gzip: bool,
        paired: bool,
    ) -> Result<Self> {
        let postfix = if gzip { ".gz" } else { "" };
        let ext = format.extension();
        if paired {
            let mut sinks = Vec::with_capacity(labels.len());
            for label in labels {
                let p1 = PathBuf::from(format!("{}_{}_1.{}{}", prefix, label, ext, postfix));
                let p2 = PathBuf::from(format!("{}_{}_2.{}{}", prefix, label, ext, postfix));
                sinks.push((
                    ReadSink::create(&p1, format, gzip)?,
                    ReadSink::create(&p2, format, gzip)?,
                ));
            }
            Ok(SinkSet::Paired(sinks))
        } else {
            let mut sinks = Vec::with_capacity(labels.len());
            for label in labels {
                let path = PathBuf::from(format!("{}_{}.{}{}", prefix, label, ext, postfix));
                sinks.push(ReadSink::create(&path, format, gzip)?);
            }
            Ok(SinkSet::Single(sinks))
        }
    }

    pub fn write_single(
        &mut self,
        category: Category,
        num_filters: usize,
        rec: &ReadRecord,
        score: Option<f64>,
    ) -> std::io::Result<()> {
        match self {
            SinkSet::Single(sinks) => {
                sinks[sink_index(category, num_filters)].write_record(rec, score)
            }
            SinkSet::Paired(_) => unreachable!("single-end write on paired sinks"),
        }
    }

    /// Both mates go out as one unit so the `_1`/`_2` files stay aligned.
    pub fn write_pair(
        &mut self,
        category: Category,
        num_filters: usize,
        rec1: &ReadRecord,
        rec2: &ReadRecord,
        score1: Option<f64>,
        score2: Option<f64>,
    ) -> std::io::Result<()> {
        match self {
            SinkSet::Paired(sinks) => {
                let (s1, s2) = &mut sinks[sink_index(category, num_filters)];
                s1.write_record(rec1, score1)?;
                s2.write_record(rec2, score2)
            }
            SinkSet::Single(_) => unreachable!("paired write on single-end sinks"),
        }
    }

    pub fn finish(&mut self) -> Result<()> {
        match self {
            SinkSet::Single(sinks) => {
                for sink in sinks {
                    sink.finish()?;
                }
            }
            SinkSet::Paired(sinks) => {
                for (s1, s2) in sinks {
                    s1.finish()?;
                    s2.finish()?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(head: &str, seq: &[u8], qual: Option<&[u8]>) -> ReadRecord {
        ReadRecord {
            head: head.to_string(),
            seq: seq.to_vec(),
            qual: qual.map(|q| q.to_vec()),
        }
    }

    #[test]
    fn pair_ids() {
        let rec = record("read7/1 1:N:0:ATCACG", b"ACGT", None);
        assert_eq!(rec.id(), "read7/1");
        assert_eq!(rec.pair_prefix(), "read7");
        assert_eq!(rec.mate_num(), Some(1));
        assert!(!rec.is_unchaste());

        let bare = record("contig3", b"ACGT", None);
        assert_eq!(bare.pair_prefix(), "contig3");
        assert_eq!(bare.mate_num(), None);

        let unchaste = record("read8/2 2:Y:0:ATCACG", b"ACGT", None);
        assert!(unchaste.is_unchaste());
    }

    #[test]
    fn formats_records() {
        let rec = record("r1", b"ACGT", Some(b"FFFF"));
        let mut out = Vec::new();
        write_formatted(&mut out, OutputFormat::Fastq, &rec, None).unwrap();
        assert_eq!(out, b"@r1\nACGT\n+\nFFFF\n");

        out.clear();
        write_formatted(&mut out, OutputFormat::Fasta, &rec, Some(0.6)).unwrap();
        assert_eq!(out, b">r1 0.6\nACGT\n");

        // FASTA-born record written as FASTQ gets placeholder qualities
        let noqual = record("r2", b"ACG", None);
        out.clear();
        write_formatted(&mut out, OutputFormat::Fastq, &noqual, None).unwrap();
        assert_eq!(out, b"@r2\nACG\n+\nIII\n");
    }

    #[test]
    fn reads_plain_and_gzip_fastq() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("reads.fq");
        std::fs::write(&plain, "@r1/1\nACGT\n+\nFFFF\n@r2/1\nTTTT\n+\nFFFF\n").unwrap();

        let mut stream = RecordStream::open(&plain).unwrap();
        let r1 = stream.next_record().unwrap().unwrap();
        assert_eq!(r1.head, "r1/1");
        assert_eq!(r1.seq, b"ACGT");
        assert_eq!(r1.qual.as_deref(), Some(&b"FFFF"[..]));
        assert!(stream.next_record().unwrap().is_some());
        assert!(stream.next_record().unwrap().is_none());

        let gz = dir.path().join("reads.fq.gz");
        let mut enc = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        enc.write_all(b"@r1/1\nACGT\n+\nFFFF\n").unwrap();
        enc.finish().unwrap();
        let mut stream = RecordStream::open(&gz).unwrap();
        assert_eq!(stream.next_record().unwrap().unwrap().seq, b"ACGT");
    }

    #[test]
    fn reads_multiline_fasta() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fa");
        std::fs::write(&path, ">c1 sample\nACGT\nACGT\n>c2\nTT\n").unwrap();
        let mut stream = RecordStream::open(&path).unwrap();
        let rec = stream.next_record().unwrap().unwrap();
        assert_eq!(rec.head, "c1 sample");
        assert_eq!(rec.seq, b"ACGTACGT");
        assert!(rec.qual.is_none());
    }

    #[test]
    fn empty_input_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.fq");
        std::fs::write(&path, "").unwrap();
        let mut stream = RecordStream::open(&path).unwrap();
        assert!(stream.next_record().unwrap().is_none());
    }
}
