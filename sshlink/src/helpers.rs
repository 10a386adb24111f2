use std::fmt::Debug;

use ssh_encoding::{Decode, Encode};

#[doc(hidden)]
pub trait EncodedExt {
    fn encoded(&self) -> Result<Vec<u8>, ssh_encoding::Error>;
}

impl<E: Encode + ?Sized> EncodedExt for E {
    fn encoded(&self) -> Result<Vec<u8>, ssh_encoding::Error> {
        let mut buf = Vec::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// An SSH `name-list`: comma-separated names, encoded as a string.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct NameList(pub Vec<String>);

impl Debug for NameList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl NameList {
    pub fn as_encoded_string(&self) -> String {
        self.0.join(",")
    }

    pub fn from_encoded_string(value: &str) -> Self {
        if value.is_empty() {
            return Self(Vec::new());
        }
        Self(value.split(',').map(|x| x.to_string()).collect())
    }
}

impl Encode for NameList {
    fn encoded_len(&self) -> Result<usize, ssh_encoding::Error> {
        self.as_encoded_string().encoded_len()
    }

    fn encode(&self, writer: &mut impl ssh_encoding::Writer) -> Result<(), ssh_encoding::Error> {
        self.as_encoded_string().encode(writer)
    }
}

impl Decode for NameList {
    fn decode(reader: &mut impl ssh_encoding::Reader) -> Result<Self, ssh_encoding::Error> {
        let s = String::decode(reader)?;
        Ok(Self::from_encoded_string(&s))
    }

    type Error = ssh_encoding::Error;
}

/// Split a payload into its message number and the remaining reader.
pub(crate) fn split_message(payload: &[u8]) -> Option<(u8, &[u8])> {
    payload.split_first().map(|(n, rest)| (*n, rest))
}
