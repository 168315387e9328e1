use byte_unit::{Byte, UnitType};

pub trait IntoAdjustedByte {
    fn adjusted(self) -> byte_unit::AdjustedByte;
}

impl IntoAdjustedByte for u64 {
    fn adjusted(self) -> byte_unit::AdjustedByte {
        Byte::from_u64(self).get_appropriate_unit(UnitType::Binary)
    }
}
