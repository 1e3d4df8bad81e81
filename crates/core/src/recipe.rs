//! Conversion recipe generation
//!
//! A recipe is a small shell script with a fixed exit-code contract: 0 on
//! success, 1 when the input file is missing, 2 on download failure, 3 when
//! the downloaded input is empty, 4 when any converted output is empty. The
//! script is the entire external-process policy: which downloader runs,
//! which converter, at what niceness.

use crate::config::Config;
use crate::{Error, Result};
use std::fmt::Write as _;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tracing::{error, info};

/// Script file name inside a job workdir
pub(crate) const SCRIPT_NAME: &str = "job.sh";

/// Download step of a recipe
pub(crate) struct DownloadStep<'a> {
    /// URI to fetch
    pub uri: &'a str,
}

/// Generate the recipe text for one conversion job
///
/// `temp_file` is the input image inside the workdir, either downloaded by
/// the recipe itself or written there beforehand for raw payloads.
pub(crate) fn generate(
    workdir: &Path,
    temp_file: &str,
    download: Option<&DownloadStep<'_>>,
    config: &Config,
) -> String {
    let mut script = String::new();

    let _ = writeln!(script, "#! /bin/sh");
    let _ = writeln!(script, "cd '{}'", workdir.display());

    if let Some(step) = download {
        let _ = writeln!(script, "wget -qO '{temp_file}' '{}'", step.uri);
        let _ = writeln!(script, "test $? -eq 0 || exit 2");
        let _ = writeln!(script, "test -f '{temp_file}' || exit 1");
        let _ = writeln!(script, "test -s '{temp_file}' || exit 3");
    }

    for format in &config.output_formats {
        let _ = writeln!(
            script,
            "nice -n {} {} '{temp_file}' -resize {} -colors 255 \
             -dither FloydSteinberg -background transparent '{}:{}' &",
            config.effective_niceness(),
            config.recipe_template.converter_command(),
            format.dimensions,
            format.format_spec,
            format.filename(),
        );
    }

    let _ = writeln!(script, "for i in `seq {}`", config.output_formats.len());
    let _ = writeln!(script, "do");
    let _ = writeln!(script, "    wait");
    let _ = writeln!(script, "done");

    for format in &config.output_formats {
        let _ = writeln!(script, "test -s '{}' || exit 4", format.filename());
    }

    let _ = writeln!(script, "exit 0");

    script
}

/// Write a recipe to disk and make it executable
///
/// An orphaned script from an earlier run is replaced; a directory squatting
/// on the script path is an unrecoverable state.
///
/// # Errors
///
/// Returns an error when the path is unusable or the write fails.
pub(crate) fn write_script(path: &Path, text: &str) -> Result<()> {
    match std::fs::metadata(path) {
        Err(_) => {}
        Ok(meta) if meta.is_file() => {
            error!("BUG: found orphaned script {:?}, replacing", path.display());
        }
        Ok(_) => {
            error!("BUG: found non-file path {:?}, cannot continue", path.display());
            return Err(Error::internal(format!(
                "non-file path {} in job workdir",
                path.display()
            )));
        }
    }

    info!("generate job script \"{}\"", path.display());

    if let Err(e) = std::fs::write(path, text) {
        let err = Error::io(e, path, "write");
        crate::fs::remove_file_quiet(path);
        return Err(err);
    }

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| Error::io(e, path, "chmod"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecipeTemplate;
    use std::path::PathBuf;

    #[test]
    fn test_download_recipe_layout() {
        let config = Config::default();
        let script = generate(
            &PathBuf::from("/cache/.tmp/abc"),
            "original_downloaded",
            Some(&DownloadStep { uri: "http://x/y" }),
            &config,
        );

        assert!(script.starts_with("#! /bin/sh\ncd '/cache/.tmp/abc'\n"));
        assert!(script.contains("wget -qO 'original_downloaded' 'http://x/y'\n"));
        assert!(script.contains("test $? -eq 0 || exit 2\n"));
        assert!(script.contains("test -f 'original_downloaded' || exit 1\n"));
        assert!(script.contains("test -s 'original_downloaded' || exit 3\n"));
        assert!(script.ends_with("exit 0\n"));
    }

    #[test]
    fn test_convert_steps_cover_all_formats() {
        let config = Config::default();
        let script = generate(&PathBuf::from("/w"), "original_raw", None, &config);

        assert!(!script.contains("wget"));
        assert!(script.contains(
            "nice -n 19 convert 'original_raw' -resize 120x120 -colors 255 \
             -dither FloydSteinberg -background transparent 'png:png@120x120' &"
        ));
        assert!(script.contains("'png:png@200x200' &"));
        assert!(script.contains("'jpg:jpg@400x400' &"));
        assert!(script.contains("for i in `seq 3`"));
        assert!(script.contains("test -s 'png@120x120' || exit 4"));
        assert!(script.contains("test -s 'jpg@400x400' || exit 4"));
    }

    #[test]
    fn test_template_selects_converter() {
        let config = Config {
            recipe_template: RecipeTemplate::GraphicsMagick,
            ..Config::default()
        };
        let script = generate(&PathBuf::from("/w"), "original_raw", None, &config);
        assert!(script.contains("gm convert 'original_raw'"));
    }

    #[test]
    fn test_write_script_sets_executable_bit() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(SCRIPT_NAME);

        write_script(&path, "#! /bin/sh\nexit 0\n").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }

    #[test]
    fn test_write_script_rejects_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join(SCRIPT_NAME);
        std::fs::create_dir(&path).unwrap();

        assert!(write_script(&path, "#! /bin/sh\n").is_err());
    }
}
