//! Fixed-size page: an identified byte buffer. Node views interpret the
//! bytes; the page itself knows nothing about entries or objects.

/// A page checked out from the page manager. Identity is `id` (non-zero;
/// 0 means "no page"). The body is a fixed-length byte array of the page
/// manager's page size.
#[derive(Clone)]
pub struct Page {
    id: u32,
    data: Vec<u8>,
}

impl Page {
    /// Create a zeroed page with the given identity.
    pub fn new(id: u32, size: usize) -> Self {
        Self {
            id,
            data: vec![0u8; size],
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Zero the whole body. The identity is unchanged.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_page_is_zeroed() {
        let p = Page::new(7, 256);
        assert_eq!(p.id(), 7);
        assert_eq!(p.size(), 256);
        assert!(p.data().iter().all(|&b| b == 0));
    }

    #[test]
    fn clear_keeps_identity() {
        let mut p = Page::new(3, 128);
        p.data_mut()[0] = 0xAB;
        p.data_mut()[127] = 0xCD;
        p.clear();
        assert_eq!(p.id(), 3);
        assert!(p.data().iter().all(|&b| b == 0));
    }
}
