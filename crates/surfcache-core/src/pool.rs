use std::collections::VecDeque;
use std::hash::Hash;

use hashbrown::HashMap;

use crate::types::ImageDesc;

/// Released host images kept for reuse, in least-recently-released order.
///
/// Requests are matched on the full [`ImageDesc`]; the most recently released match wins.
#[derive(Debug)]
pub struct ImagePool<I> {
    order: VecDeque<I>,
    descs: HashMap<I, ImageDesc>,
    capacity: usize,
}

impl<I> ImagePool<I>
where
    I: Copy + Eq + Hash,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            descs: HashMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Adds an image. Returns images evicted to stay within capacity; the caller destroys them.
    #[must_use]
    pub fn put(&mut self, image: I, desc: ImageDesc) -> Vec<I> {
        if self.descs.insert(image, desc).is_some() {
            self.remove_from_order(&image);
        }
        self.order.push_back(image);

        let mut evicted = Vec::new();
        while self.order.len() > self.capacity {
            let Some(oldest) = self.pop_lru() else {
                break;
            };
            evicted.push(oldest);
        }
        evicted
    }

    pub fn take(&mut self, desc: &ImageDesc) -> Option<I> {
        let pos = self
            .order
            .iter()
            .rposition(|image| self.descs.get(image) == Some(desc))?;
        let image = self.order.remove(pos)?;
        self.descs.remove(&image);
        Some(image)
    }

    pub fn pop_lru(&mut self) -> Option<I> {
        let image = self.order.pop_front()?;
        self.descs.remove(&image);
        Some(image)
    }

    /// Empties the pool, returning every image.
    pub fn drain(&mut self) -> Vec<I> {
        self.descs.clear();
        self.order.drain(..).collect()
    }

    fn remove_from_order(&mut self, image: &I) {
        if let Some(pos) = self.order.iter().position(|i| i == image) {
            self.order.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TextureFormat;

    #[test]
    fn pool_matches_desc_and_evicts_oldest() {
        let small = ImageDesc::new_2d(16, 16, TextureFormat::A8R8G8B8);
        let large = ImageDesc::new_2d(64, 64, TextureFormat::A8R8G8B8);

        let mut pool = ImagePool::new(2);
        assert!(pool.put(1u32, small).is_empty());
        assert!(pool.put(2, large).is_empty());
        assert_eq!(pool.put(3, small), vec![1]);

        assert_eq!(pool.take(&small), Some(3));
        assert_eq!(pool.take(&small), None);
        assert_eq!(pool.take(&large), Some(2));
        assert!(pool.is_empty());
    }
}
