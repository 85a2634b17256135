// Chunked file transfer helpers shared by full and archive sync

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use strand_common::{Result, StrandError};

/// Resolve a transferred file name inside `dir`, refusing anything that
/// could escape it
pub fn resolve(dir: &Path, name: &str) -> Result<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    if !valid {
        return Err(StrandError::BadData(format!(
            "invalid file name in sync part: `{}`",
            name
        )));
    }
    Ok(dir.join(name))
}

/// Read up to `max` bytes from `path` starting at `offset`
///
/// Returns the data and whether more data follows.
pub fn read_part(path: &Path, offset: u64, max: usize) -> Result<(Vec<u8>, bool)> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if offset > len {
        return Err(StrandError::BadData(format!(
            "offset {} is beyond the end of `{}` ({} bytes)",
            offset,
            path.display(),
            len
        )));
    }

    let n = (len - offset).min(max as u64) as usize;
    let mut data = vec![0u8; n];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut data)?;
    Ok((data, offset + (n as u64) < len))
}

/// Write `data` into `path` at `offset`
///
/// Offset `0` starts the file over; any other offset requires the earlier
/// parts to be present already. Writing the same part twice is harmless.
pub fn write_part(path: &Path, offset: u64, data: &[u8]) -> Result<()> {
    let mut file = if offset == 0 {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        File::create(path)?
    } else {
        let file = OpenOptions::new().write(true).open(path).map_err(|e| {
            StrandError::BadData(format!(
                "missing earlier parts of `{}`: {}",
                path.display(),
                e
            ))
        })?;
        let len = file.metadata()?.len();
        if len < offset {
            return Err(StrandError::BadData(format!(
                "part at offset {} does not follow `{}` ({} bytes)",
                offset,
                path.display(),
                len
            )));
        }
        file
    };

    file.seek(SeekFrom::Start(offset))?;
    file.write_all(data)?;
    file.set_len(offset + data.len() as u64)?;
    file.flush()?;
    Ok(())
}
