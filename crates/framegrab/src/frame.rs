/// A decoded frame in canonical layout: 3-channel BGR, row-major, tightly packed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl Frame {
    pub const CHANNELS: u8 = 3;

    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(
            data.len(),
            width as usize * height as usize * Self::CHANNELS as usize,
            "data length must equal width * height * 3"
        );
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        Self::CHANNELS
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// BGR triple at column `x`, row `y`.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 3;
        let px = self.data.get(offset..offset + 3)?;
        Some([px[0], px[1], px[2]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_and_accessors() {
        let frame = Frame::new(vec![0u8; 12], 2, 2);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.data().len(), 12);
    }

    #[test]
    fn test_pixel_is_row_major_bgr() {
        // 2x2, pixel (x=0, y=1) starts at byte 6
        let mut data = vec![0u8; 12];
        data[6] = 10;
        data[7] = 20;
        data[8] = 30;
        let frame = Frame::new(data, 2, 2);
        assert_eq!(frame.pixel(0, 1), Some([10, 20, 30]));
        assert_eq!(frame.pixel(1, 1), Some([0, 0, 0]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.pixel(0, 2), None);
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * 3")]
    fn test_mismatched_data_length_panics_in_debug() {
        Frame::new(vec![0u8; 10], 2, 2);
    }
}
