use std::collections::HashMap;
use std::str;

use anyhow::{bail, Result};

use crate::bencoding::Value;

#[derive(PartialEq, Debug, Clone)]
pub enum MetainfoFile {
    SingleFile(MetainfoSingleFile),
    MultiFile(MetainfoMultiFile),
}

#[derive(PartialEq, Debug, Clone)]
pub struct MetainfoSingleFile {
    pub name: String, // advisory file name
    pub length: u64,
}

#[derive(PartialEq, Debug, Clone)]
pub struct MetainfoMultiFile {
    pub name: String, // advisory directory name
    pub files: Vec<MultifileFile>,
}

#[derive(PartialEq, Debug, Clone)]
pub struct MultifileFile {
    pub length: u64,
    pub path: Vec<String>, // path elements, the last one is the file name
}

pub struct InfoDict {
    pub piece_length: u64,
    pub pieces: Vec<[u8; 20]>,
    pub file: MetainfoFile,
}

fn utf8_string(value: Option<&Value>, what: &str) -> Result<String> {
    match value {
        Some(Value::Str(v)) => match str::from_utf8(v) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => bail!("The .torrent file \"{what}\" is not an UTF8 string"),
        },
        _ => bail!("The .torrent file does not contain a valid \"{what}\""),
    }
}

fn non_negative(value: Option<&Value>, what: &str) -> Result<u64> {
    match value {
        Some(Value::Int(a)) if *a >= 0 => Ok(*a as u64),
        Some(Value::Int(_)) => bail!("The .torrent file \"{what}\" kv cannot be < 0"),
        _ => bail!("The .torrent file does not contain a valid \"{what}\""),
    }
}

pub fn get_infodict(info_dict: &HashMap<Vec<u8>, Value>) -> Result<InfoDict> {
    let name = utf8_string(info_dict.get(b"name".as_slice()), "info.name")?;

    let piece_length = non_negative(info_dict.get(b"piece length".as_slice()), "info.piece length")?;
    if piece_length == 0 {
        bail!("The .torrent file \"info.piece length\" kv cannot be 0");
    }

    let pieces = match info_dict.get(b"pieces".as_slice()) {
        Some(Value::Str(pieces_bytes)) => {
            if pieces_bytes.len() % 20 != 0 {
                bail!(
                    "The .torrent file contains \"info.pieces\" that is not a string of length divisible by 20"
                );
            }
            pieces_bytes
                .chunks_exact(20)
                .map(|c| {
                    let mut piece = [0; 20];
                    piece.copy_from_slice(c);
                    piece
                })
                .collect()
        }
        _ => bail!("The .torrent file does not contain a valid \"info.pieces\""),
    };

    let file = if info_dict.contains_key(b"length".as_slice()) {
        MetainfoFile::SingleFile(MetainfoSingleFile {
            name,
            length: non_negative(info_dict.get(b"length".as_slice()), "info.length")?,
        })
    } else if let Some(Value::List(files_list)) = info_dict.get(b"files".as_slice()) {
        let mut files = Vec::new();
        for f in files_list {
            let entry = match f {
                Value::Dict(a, _, _) => a,
                _ => bail!("The .torrent file \"info.files\" kv has an entry that is not a dict"),
            };
            let length = non_negative(entry.get(b"length".as_slice()), "info.files.length")?;
            let path = match entry.get(b"path".as_slice()) {
                Some(Value::List(elements)) if !elements.is_empty() => elements
                    .iter()
                    .map(|e| utf8_string(Some(e), "info.files.path"))
                    .collect::<Result<Vec<String>>>()?,
                _ => bail!(
                    "The .torrent file \"info.files\" kv has an entry that has no valid \"path\""
                ),
            };
            files.push(MultifileFile { length, path });
        }
        MetainfoFile::MultiFile(MetainfoMultiFile { name, files })
    } else {
        bail!(
            "The .torrent file does not contain either a valid \"info.length\" or a \"info.files\""
        );
    };

    Ok(InfoDict {
        piece_length,
        pieces,
        file,
    })
}
