//! `/proc/<pid>/maps` parsing.

use std::path::PathBuf;

use crate::error::ElfError;

/// One line of a maps file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    /// File offset of the mapping
    pub offset: u64,
    /// Backing file, if the mapping is file-backed
    pub path: Option<PathBuf>,
}

impl Mapping {
    pub fn is_executable(&self) -> bool {
        self.perms.as_bytes().get(2) == Some(&b'x')
    }
}

fn hex(field: &str, line: &str) -> Result<u64, ElfError> {
    u64::from_str_radix(field, 16).map_err(|_| ElfError::BadMapsLine(line.to_string()))
}

pub fn parse_maps(text: &str) -> Result<Vec<Mapping>, ElfError> {
    let mut mappings = Vec::new();
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let mut fields = line.split_whitespace();
        let bad = || ElfError::BadMapsLine(line.to_string());

        let range = fields.next().ok_or_else(bad)?;
        let perms = fields.next().ok_or_else(bad)?;
        let offset = fields.next().ok_or_else(bad)?;
        let _dev = fields.next().ok_or_else(bad)?;
        let _inode = fields.next().ok_or_else(bad)?;
        let rest: Vec<&str> = fields.collect();

        let (start, end) = range.split_once('-').ok_or_else(bad)?;
        // Pseudo mappings like [stack] and [vdso] have no backing file.
        let path = match rest.join(" ") {
            p if p.starts_with('/') => Some(PathBuf::from(p.trim_end_matches(" (deleted)"))),
            _ => None,
        };

        mappings.push(Mapping {
            start: hex(start, line)?,
            end: hex(end, line)?,
            perms: perms.to_string(),
            offset: hex(offset, line)?,
            path,
        });
    }
    Ok(mappings)
}

/// An executable file mapped into the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedImage {
    pub path: PathBuf,
    /// Start of the offset-0 mapping the executable segment is loaded with
    pub base: u64,
    /// End of the last mapping contiguous with `base`
    pub end: u64,
}

/// A run of address-contiguous mappings of one file.
struct Run<'a> {
    path: &'a PathBuf,
    base: Option<u64>,
    end: u64,
    executable: bool,
}

fn flush(run: Option<Run<'_>>, images: &mut Vec<MappedImage>) {
    let Some(Run { path, base: Some(base), end, executable: true }) = run else { return };
    if !images.iter().any(|img| &img.path == path) {
        images.push(MappedImage { path: path.clone(), base, end });
    }
}

/// Group file-backed mappings into images, in the order they first appear.
///
/// The loader maps every segment of an object back to back, so an image is a
/// contiguous run of mappings of one file that starts at offset 0 and holds
/// an executable mapping. Other mappings of the same file, such as read-only
/// copies a backtrace printer maps in, are not images.
pub fn mapped_images(mappings: &[Mapping]) -> Vec<MappedImage> {
    let mut images: Vec<MappedImage> = Vec::new();
    let mut run: Option<Run<'_>> = None;
    for mapping in mappings {
        let Some(path) = &mapping.path else {
            flush(run.take(), &mut images);
            continue;
        };
        if let Some(current) = run.as_mut().filter(|r| r.path == path && r.end == mapping.start) {
            current.end = mapping.end;
            current.executable |= mapping.is_executable();
            continue;
        }
        flush(run.take(), &mut images);
        run = Some(Run {
            path,
            base: (mapping.offset == 0).then_some(mapping.start),
            end: mapping.end,
            executable: mapping.is_executable(),
        });
    }
    flush(run, &mut images);
    images
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const MAPS: &str = indoc! {"
        55d4c8a00000-55d4c8a06000 r--p 00000000 08:01 1311 /usr/bin/selftest
        55d4c8a06000-55d4c8a40000 r-xp 00006000 08:01 1311 /usr/bin/selftest
        55d4c8c41000-55d4c8c62000 rw-p 00000000 00:00 0    [heap]
        7f3a1c000000-7f3a1c028000 r--p 00000000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
        7f3a1c028000-7f3a1c1bd000 r-xp 00028000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
        7f3a1c400000-7f3a1c401000 r--p 00000000 08:01 4400 /usr/lib/locale/C.utf8/LC_CTYPE
        7ffd6b9e1000-7ffd6b9e3000 r-xp 00000000 00:00 0    [vdso]
    "};

    #[test]
    fn test_parse_maps() {
        let mappings = parse_maps(MAPS).unwrap();
        assert_eq!(mappings.len(), 7);
        assert_eq!(mappings[1].start, 0x55d4c8a06000);
        assert_eq!(mappings[1].offset, 0x6000);
        assert!(mappings[1].is_executable());
        assert_eq!(mappings[2].path, None);
        assert_eq!(mappings[6].path, None);
    }

    #[test]
    fn test_mapped_images_skip_data_files() {
        let images = mapped_images(&parse_maps(MAPS).unwrap());
        let paths: Vec<_> = images.iter().map(|i| i.path.to_string_lossy().into_owned()).collect();
        assert_eq!(paths, vec!["/usr/bin/selftest", "/usr/lib/x86_64-linux-gnu/libc.so.6"]);
        assert_eq!(images[0].base, 0x55d4c8a00000);
        assert_eq!(images[1].base, 0x7f3a1c000000);
        assert_eq!(images[1].end, 0x7f3a1c1bd000);
    }

    #[test]
    fn test_read_only_copy_below_image_is_not_the_base() {
        let maps = indoc! {"
            55d4c8a00000-55d4c8a06000 r--p 00000000 08:01 1311 /usr/bin/selftest
            55d4c8a06000-55d4c8a40000 r-xp 00006000 08:01 1311 /usr/bin/selftest
            7f3a1b000000-7f3a1b1d7000 r--p 00000000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
            7f3a1b200000-7f3a1b400000 r--p 00000000 08:01 1311 /usr/bin/selftest
            7f3a1c000000-7f3a1c028000 r--p 00000000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
            7f3a1c028000-7f3a1c1bd000 r-xp 00028000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
            7f3a1c1bd000-7f3a1c215000 r--p 001bd000 08:01 2290 /usr/lib/x86_64-linux-gnu/libc.so.6
        "};
        let images = mapped_images(&parse_maps(maps).unwrap());
        let bases: Vec<(String, u64)> =
            images.iter().map(|i| (i.path.to_string_lossy().into_owned(), i.base)).collect();
        assert_eq!(
            bases,
            vec![
                ("/usr/bin/selftest".to_string(), 0x55d4c8a00000),
                ("/usr/lib/x86_64-linux-gnu/libc.so.6".to_string(), 0x7f3a1c000000),
            ]
        );
        assert_eq!(images[1].end, 0x7f3a1c215000);
    }

    #[test]
    fn test_segment_gap_keeps_image_contiguous() {
        let maps = indoc! {"
            7f00000000-7f00001000 r--p 00000000 08:01 9 /lib/libgap.so
            7f00001000-7f00002000 ---p 00001000 08:01 9 /lib/libgap.so
            7f00002000-7f00003000 r-xp 00002000 08:01 9 /lib/libgap.so
            7f00010000-7f00011000 r-xp 00005000 08:01 9 /lib/libgap.so
        "};
        let images = mapped_images(&parse_maps(maps).unwrap());
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].base, 0x7f00000000);
        assert_eq!(images[0].end, 0x7f00003000);
    }

    #[test]
    fn test_deleted_and_spaced_paths() {
        let maps = "1000-2000 r-xp 00000000 08:01 7 /tmp/my bin (deleted)\n";
        let mappings = parse_maps(maps).unwrap();
        assert_eq!(mappings[0].path, Some(PathBuf::from("/tmp/my bin")));
    }

    #[test]
    fn test_malformed_line() {
        assert!(matches!(parse_maps("zzzz r-xp 0 0 0\n"), Err(ElfError::BadMapsLine(_))));
        assert!(matches!(parse_maps("1000-2000 r-xp\n"), Err(ElfError::BadMapsLine(_))));
    }
}
