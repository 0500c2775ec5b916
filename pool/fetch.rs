// ========================================================================================
//
//                               PROVIDER EXTRACT FETCHER
//
// ========================================================================================

use dwldutil::{DLFile, Downloader};
use flate2::read::MultiGzDecoder;
use indicatif::ProgressStyle;
use rayon::prelude::*;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Full-year consolidated file identifiers, one per pooled survey year.
const FULL_YEAR_FILES: &[(u16, &str)] = &[
    (2016, "h192"),
    (2017, "h201"),
    (2018, "h209"),
    (2019, "h216"),
    (2020, "h224"),
    (2021, "h233"),
];

/// The 1996-2021 pooled linkage file for the common variance structure.
pub const LINKAGE_FILE_ID: &str = "h36u21";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("No full-year consolidated file is known for survey year {0}.")]
    UnknownYear(u16),
    #[error("Offline mode: required extract '{0}' is not present in the cache directory.")]
    NotCached(PathBuf),
    #[error("Failed to create async runtime for downloads: {0}")]
    RuntimeCreation(io::Error),
}

/// Resolves the provider file identifier for one survey year.
pub fn file_id_for_year(year: u16) -> Result<&'static str, FetchError> {
    FULL_YEAR_FILES
        .iter()
        .find(|(y, _)| *y == year)
        .map(|(_, id)| *id)
        .ok_or(FetchError::UnknownYear(year))
}

/// Paths of the cached extracts backing one pipeline run, yearly files in
/// ascending year order.
#[derive(Debug)]
pub struct FetchedFiles {
    pub yearly: Vec<(u16, PathBuf)>,
    pub linkage: PathBuf,
}

/// Synchronizes the cache directory with the requested survey years.
///
/// Extracts already cached as `<id>.csv` are left alone. Compressed
/// `<id>.csv.gz` leftovers are decompressed without re-downloading. Anything
/// else is downloaded from `<base_url>/<id>.csv.gz`, decompressed, and the
/// compressed intermediate removed. In offline mode a missing extract is a
/// fatal error instead of a download.
pub fn resolve_and_fetch(
    years: &[u16],
    cache_dir: &Path,
    base_url: &str,
    offline: bool,
) -> Result<FetchedFiles, FetchError> {
    fs::create_dir_all(cache_dir).map_err(|source| FetchError::Io {
        path: cache_dir.to_path_buf(),
        source,
    })?;
    eprintln!(
        "> Checking for extracts in cache directory: {}",
        cache_dir.display()
    );

    let mut sorted_years = years.to_vec();
    sorted_years.sort_unstable();
    sorted_years.dedup();

    let mut ids: Vec<&'static str> = Vec::with_capacity(sorted_years.len() + 1);
    for &year in &sorted_years {
        ids.push(file_id_for_year(year)?);
    }
    ids.push(LINKAGE_FILE_ID);

    let mut to_download: Vec<(&'static str, PathBuf, PathBuf)> = Vec::new();
    let mut to_decompress: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut cached = 0usize;
    for &id in &ids {
        let csv_path = cache_dir.join(format!("{id}.csv"));
        let gz_path = cache_dir.join(format!("{id}.csv.gz"));
        if csv_path.exists() {
            cached += 1;
        } else if gz_path.exists() {
            eprintln!("> Found previously downloaded archive for {id}. Skipping download.");
            to_decompress.push((gz_path, csv_path));
        } else if offline {
            return Err(FetchError::NotCached(csv_path));
        } else {
            to_download.push((id, gz_path, csv_path));
        }
    }
    eprintln!(
        "> Found {} cached extracts. Found {} downloaded archives. Need to download {}.",
        cached,
        to_decompress.len(),
        to_download.len()
    );

    if !to_download.is_empty() {
        let downloaded = download_missing_files(&to_download, base_url)?;
        to_decompress.extend(downloaded);
    }

    if !to_decompress.is_empty() {
        eprintln!("> Decompressing {} extracts...", to_decompress.len());
        to_decompress
            .into_par_iter()
            .try_for_each(|(gz_path, csv_path)| -> Result<(), FetchError> {
                decompress_extract(&gz_path, &csv_path)?;
                // The compressed file is an intermediate artifact.
                fs::remove_file(&gz_path).map_err(|source| FetchError::Io {
                    path: gz_path.clone(),
                    source,
                })?;
                Ok(())
            })?;
        eprintln!("> Decompression complete.");
    }

    let yearly = sorted_years
        .iter()
        .map(|&year| {
            let id = file_id_for_year(year)?;
            Ok((year, cache_dir.join(format!("{id}.csv"))))
        })
        .collect::<Result<Vec<_>, FetchError>>()?;

    Ok(FetchedFiles {
        yearly,
        linkage: cache_dir.join(format!("{LINKAGE_FILE_ID}.csv")),
    })
}

/// Orchestrates the parallel download of all missing extracts.
/// Returns the (compressed, final) path pairs for the decompression stage.
fn download_missing_files(
    items: &[(&'static str, PathBuf, PathBuf)],
    base_url: &str,
) -> Result<Vec<(PathBuf, PathBuf)>, FetchError> {
    eprintln!(
        "> Downloading {} missing extracts from the data provider...",
        items.len()
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(FetchError::RuntimeCreation)?;

    runtime.block_on(async {
        let mut downloader = Downloader::new();
        let mut fetched = Vec::with_capacity(items.len());

        let base = base_url.trim_end_matches('/');
        for (id, gz_path, csv_path) in items {
            let url = format!("{base}/{id}.csv.gz");
            let file_to_download = DLFile::new()
                .with_url(&url)
                .with_path(&gz_path.to_string_lossy());

            // Each call to `add_file` consumes the downloader and returns a
            // new one, so we must re-assign it.
            downloader = downloader.add_file(file_to_download);
            fetched.push((gz_path.clone(), csv_path.clone()));
        }

        // Use a progress bar style that does not require the total file size.
        let style = ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap()
            .progress_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏");
        let configured_downloader = downloader
            .with_style(style)
            .with_max_concurrent_downloads(4)
            .with_max_redirections(5);

        configured_downloader.start();

        Ok(fetched)
    })
}

/// Streams one gzip-compressed extract out to its final CSV path.
fn decompress_extract(gz_path: &Path, csv_path: &Path) -> Result<(), FetchError> {
    let input = File::open(gz_path).map_err(|source| FetchError::Io {
        path: gz_path.to_path_buf(),
        source,
    })?;
    let mut decoder = MultiGzDecoder::new(BufReader::new(input));
    let output = File::create(csv_path).map_err(|source| FetchError::Io {
        path: csv_path.to_path_buf(),
        source,
    })?;
    let mut writer = BufWriter::new(output);
    io::copy(&mut decoder, &mut writer).map_err(|source| FetchError::Io {
        path: csv_path.to_path_buf(),
        source,
    })?;
    Ok(())
}
