use std::{fmt, str};

use anyhow::{bail, Result};
use sha1::{Digest, Sha1};
use size::{Size, Style};

use super::infodict::{self, MetainfoFile};
use crate::{bencoding::Value, util::pretty_info_hash};

#[derive(PartialEq, Debug, Clone)]
pub struct FileBoundary {
    pub path: String,
    pub offset: u64, // offset of the first byte of the file in the content
    pub length: u64,
}

#[derive(PartialEq, Debug, Clone)]
pub struct Metainfo {
    pub announce_list: Vec<Vec<String>>,
    pub piece_length: u64,     // number of bytes in each piece
    pub pieces: Vec<[u8; 20]>, // SHA1 of each piece
    pub info_hash: [u8; 20],   // SHA1 of the raw info dict
    pub file: MetainfoFile,
}

impl fmt::Display for Metainfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let files = self
            .files()
            .iter()
            .map(|f| format!("    - {} ({})", f.path, Size::from_bytes(f.length)))
            .collect::<Vec<String>>()
            .join("\n");
        write!(
            f,
            "name: {}\nannounces: {:?}\npiece_length: {}\nn. pieces: {}\ninfo_hash: {}\nfiles:\n{}",
            self.name(),
            self.announce_list,
            Size::from_bytes(self.piece_length)
                .format()
                .with_style(Style::Abbreviated),
            self.pieces.len(),
            pretty_info_hash(self.info_hash),
            files
        )
    }
}

impl Metainfo {
    pub fn new(source: &[u8]) -> Result<Self> {
        let torrent = Value::decode(source)?;
        let torrent_map = match &torrent {
            Value::Dict(m, _, _) => m,
            _ => bail!("The .torrent file is invalid: it does not contain a dict"),
        };

        // announce / announce-list
        let mut announces: Vec<Vec<String>> = Vec::new();
        match torrent_map.get(b"announce-list".as_slice()) {
            None => {}
            Some(Value::List(announce_list)) => {
                for tier in announce_list {
                    let Value::List(announces_in_tier) = tier else {
                        bail!("The .torrent file \"announce-list\" does not contain a list of lists");
                    };
                    let mut tier_list = Vec::new();
                    for announce_url in announces_in_tier {
                        match announce_url {
                            Value::Str(a) => match str::from_utf8(a) {
                                Ok(a) => {
                                    let already_listed = tier_list.contains(&a.to_string())
                                        || announces.iter().flatten().any(|u| u == a);
                                    if !already_listed {
                                        tier_list.push(a.to_string());
                                    }
                                }
                                Err(_) => bail!("The .torrent file \"announce-list\" has an element in a tier list that is not an UTF-8 string"),
                            },
                            _ => bail!("The .torrent file \"announce-list\" has an element in a tier list that is not a string"),
                        }
                    }
                    if !tier_list.is_empty() {
                        announces.push(tier_list);
                    }
                }
            }
            Some(_) => bail!(
                "The .torrent file has a \"announce-list\" field but it does not contain a list"
            ),
        }
        if announces.is_empty() {
            match torrent_map.get(b"announce".as_slice()) {
                Some(Value::Str(a)) => match str::from_utf8(a) {
                    Ok(a) => announces.push(vec![a.to_string()]),
                    _ => bail!("The .torrent file \"announce\" is not an UTF8 string"),
                },
                _ => {}
            };
        }

        // info dict
        let (info_dict, info_hash) = match torrent_map.get(b"info".as_slice()) {
            Some(Value::Dict(a, s, e)) => {
                let mut info_hash = [0; 20];
                info_hash.copy_from_slice(&Sha1::digest(&source[*s..*e]));
                (a, info_hash)
            }
            _ => bail!("The .torrent file does not contain a valid \"info\""),
        };
        let info = infodict::get_infodict(info_dict)?;

        let metainfo = Metainfo {
            announce_list: announces,
            piece_length: info.piece_length,
            pieces: info.pieces,
            info_hash,
            file: info.file,
        };
        let expected_pieces = metainfo.length().div_ceil(metainfo.piece_length);
        if expected_pieces != metainfo.pieces.len() as u64 {
            bail!(
                "The .torrent file declares {} pieces but its content needs {expected_pieces}",
                metainfo.pieces.len()
            );
        }
        Ok(metainfo)
    }

    pub fn info_hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn number_of_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Declared size of a piece, only the last one may be shorter.
    pub fn piece_size(&self, piece_idx: u32) -> usize {
        let start = piece_idx as u64 * self.piece_length;
        self.length()
            .saturating_sub(start)
            .min(self.piece_length) as usize
    }

    pub fn piece_hash(&self, piece_idx: u32) -> Option<[u8; 20]> {
        self.pieces.get(piece_idx as usize).copied()
    }

    pub fn length(&self) -> u64 {
        match &self.file {
            MetainfoFile::SingleFile(m) => m.length,
            MetainfoFile::MultiFile(m) => m.files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn name(&self) -> &str {
        match &self.file {
            MetainfoFile::SingleFile(m) => &m.name,
            MetainfoFile::MultiFile(m) => &m.name,
        }
    }

    pub fn is_single_file(&self) -> bool {
        matches!(self.file, MetainfoFile::SingleFile(_))
    }

    pub fn files(&self) -> Vec<FileBoundary> {
        match &self.file {
            MetainfoFile::SingleFile(m) => vec![FileBoundary {
                path: m.name.clone(),
                offset: 0,
                length: m.length,
            }],
            MetainfoFile::MultiFile(m) => {
                let mut offset = 0;
                m.files
                    .iter()
                    .map(|f| {
                        let boundary = FileBoundary {
                            path: f.path.join("/"),
                            offset,
                            length: f.length,
                        };
                        offset += f.length;
                        boundary
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metadata::infodict::{MetainfoMultiFile, MetainfoSingleFile, MultifileFile};

    /// A single-file torrent of `num_pieces` full pieces, with its content.
    pub(crate) fn sample_metainfo(num_pieces: usize, piece_length: usize) -> (Metainfo, Vec<Vec<u8>>) {
        let contents: Vec<Vec<u8>> = (0..num_pieces)
            .map(|p| (0..piece_length).map(|b| (p * 31 + b * 7) as u8).collect())
            .collect();
        let pieces = contents
            .iter()
            .map(|c| {
                let mut h = [0; 20];
                h.copy_from_slice(&Sha1::digest(c));
                h
            })
            .collect();
        let metainfo = Metainfo {
            announce_list: vec![vec!["http://tracker.test/announce".to_string()]],
            piece_length: piece_length as u64,
            pieces,
            info_hash: [0xab; 20],
            file: MetainfoFile::SingleFile(MetainfoSingleFile {
                name: "sample.bin".to_string(),
                length: (num_pieces * piece_length) as u64,
            }),
        };
        (metainfo, contents)
    }

    fn torrent_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce14:http://t/a/ann13:announce-listll14:http://t/a/ann");
        buf.extend_from_slice(b"el10:http://t/bee4:info");
        let info_start = buf.len();
        buf.extend_from_slice(b"d6:lengthi40000e4:name5:a.bin12:piece lengthi16384e6:pieces60:");
        buf.extend_from_slice(&[7; 60]);
        buf.extend_from_slice(b"e");
        let info_end = buf.len();
        buf.extend_from_slice(b"e");
        assert_eq!(buf[info_start], b'd');
        assert_eq!(buf[info_end - 1], b'e');
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let source = torrent_bytes();
        let m = Metainfo::new(&source).unwrap();
        assert_eq!(
            m.announce_list,
            vec![
                vec!["http://t/a/ann".to_string()],
                vec!["http://t/b".to_string()]
            ]
        );
        assert_eq!(m.number_of_pieces(), 3);
        assert_eq!(m.piece_size(0), 16384);
        assert_eq!(m.piece_size(2), 40000 - 2 * 16384);
        assert_eq!(m.piece_hash(1), Some([7; 20]));
        assert_eq!(m.piece_hash(3), None);
        assert_eq!(m.name(), "a.bin");

        let info_start = source.windows(6).position(|w| w == b"d6:len").unwrap();
        let mut expected = [0; 20];
        expected.copy_from_slice(&Sha1::digest(&source[info_start..source.len() - 1]));
        assert_eq!(m.info_hash(), expected);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let mut source = Vec::new();
        source.extend_from_slice(b"d4:infod6:lengthi40000e4:name1:a12:piece lengthi16384e6:pieces20:");
        source.extend_from_slice(&[1; 20]);
        source.extend_from_slice(b"ee");
        assert!(Metainfo::new(&source).is_err());
    }

    #[test]
    fn multi_file_boundaries() {
        let m = Metainfo {
            announce_list: vec![],
            piece_length: 10,
            pieces: vec![[0; 20]; 2],
            info_hash: [0; 20],
            file: MetainfoFile::MultiFile(MetainfoMultiFile {
                name: "dir".to_string(),
                files: vec![
                    MultifileFile {
                        length: 5,
                        path: vec!["a".to_string()],
                    },
                    MultifileFile {
                        length: 12,
                        path: vec!["sub".to_string(), "b".to_string()],
                    },
                ],
            }),
        };
        assert_eq!(m.length(), 17);
        assert_eq!(m.piece_size(1), 7);
        assert_eq!(
            m.files(),
            vec![
                FileBoundary {
                    path: "a".to_string(),
                    offset: 0,
                    length: 5
                },
                FileBoundary {
                    path: "sub/b".to_string(),
                    offset: 5,
                    length: 12
                },
            ]
        );
    }
}
