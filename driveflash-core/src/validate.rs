//! Advisory capacity check run before any device access.
//!
//! A pass means the image *likely* fits: the raw interface of a device can report a size
//! slightly different from what the OS advertises elsewhere.
use crate::device::Device;
use crate::error::ValidationError;

/// Checks that an image of `image_size` bytes fits on `device`. Equal sizes pass.
pub fn validate(image_size: u64, device: &Device) -> Result<(), ValidationError> {
    let capacity = device.capacity.ok_or(ValidationError::CapacityUnknown)?;

    if image_size > capacity {
        return Err(ValidationError::InsufficientCapacity {
            image_size,
            capacity,
        });
    }

    Ok(())
}
