//! Static and dynamic header tables, RFC 7541 §2.3 and §4.

use bytes::Bytes;
use std::collections::VecDeque;

#[derive(Debug, Clone)]
pub struct TableEntry {
    pub size: usize,
    pub name: Bytes,
    pub value: Bytes,
}

impl TableEntry {
    #[must_use]
    pub fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + 32,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ $(,)? ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + 32,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
pub static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

/// Combined static+dynamic addressing space (RFC 7541 §2.3.3): index 1 is
/// the first static entry, index 62 is the most recently inserted dynamic
/// entry.
#[derive(Debug, Clone)]
pub struct Table {
    max_size: usize,
    current_size: usize,
    entries: VecDeque<TableEntry>,
}

impl Table {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            entries: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn current_size(&self) -> usize {
        self.current_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        STATIC_TABLE.len() + self.entries.len()
    }

    /// 1-based lookup across the static table then the dynamic table.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<(&Bytes, &Bytes)> {
        if index == 0 {
            return None;
        }
        if let Some(entry) = STATIC_TABLE.get(index - 1) {
            return Some((&entry.name, &entry.value));
        }
        self.entries
            .get(index - STATIC_TABLE.len() - 1)
            .map(|e| (&e.name, &e.value))
    }

    pub fn push(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        if entry.size > self.max_size {
            // RFC 7541 §4.4: an entry larger than the table evicts
            // everything and is not itself inserted.
            self.entries.clear();
            self.current_size = 0;
            return;
        }
        self.current_size += entry.size;
        self.entries.push_front(entry);
        self.evict();
    }

    /// Dynamic table size update (RFC 7541 §6.3), driven either by our own
    /// SETTINGS_HEADER_TABLE_SIZE or an explicit encoder instruction.
    pub fn resize(&mut self, new_max_size: usize) {
        self.max_size = new_max_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            match self.entries.pop_back() {
                Some(popped) => self.current_size -= popped.size,
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_table_first_and_last_entries() {
        assert_eq!(STATIC_TABLE.len(), 61);
        assert_eq!(&STATIC_TABLE[0].name[..], b":authority");
        assert_eq!(&STATIC_TABLE[60].name[..], b"www-authenticate");
    }

    #[test]
    fn dynamic_entries_are_addressed_after_static() {
        let mut table = Table::new(4096);
        table.push(Bytes::from_static(b"x-custom"), Bytes::from_static(b"v"));
        let (name, value) = table.get(62).unwrap();
        assert_eq!(&name[..], b"x-custom");
        assert_eq!(&value[..], b"v");
    }

    #[test]
    fn eviction_respects_max_size() {
        let mut table = Table::new(40);
        table.push(Bytes::from_static(b"name-one"), Bytes::from_static(b"value-one"));
        table.push(Bytes::from_static(b"name-two"), Bytes::from_static(b"value-two"));
        assert!(table.current_size() <= 40);
        assert!(table.get(62 + 1).is_none() || table.len() < 63);
    }

    #[test]
    fn resize_to_zero_evicts_everything() {
        let mut table = Table::new(4096);
        table.push(Bytes::from_static(b"a"), Bytes::from_static(b"b"));
        table.resize(0);
        assert_eq!(table.current_size(), 0);
    }

    #[test]
    fn entry_larger_than_table_is_not_inserted() {
        let mut table = Table::new(10);
        table.push(Bytes::from_static(b"a-long-name"), Bytes::from_static(b"a-long-value"));
        assert_eq!(table.current_size(), 0);
    }
}
