use crate::prelude::*;

/// A value with a fixed little-endian byte layout.
///
/// `encode` hands back the unwritten tail of `dst`, or `None` when `dst`
/// is too short, in which case the contents of `dst` are unspecified.
pub trait Wire<'a>: Sized {
    fn encoded_len(&self) -> usize;
    fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]>;
    fn decode(pkt: &'a [u8]) -> Result<(Self, &'a [u8]), Disconnection>;
}
macro_rules! impl_wire {
    {} => {};
    {$t:ident $($rt:ident)*} => {
        #[allow(non_snake_case)]
        impl<'a, $t: Wire<'a>, $($rt: Wire<'a>),*> Wire<'a> for ($t,$($rt,)*) {
            fn encoded_len(&self) -> usize {
                let ($t, $($rt,)*) = self;
                $t.encoded_len() $(+ $rt.encoded_len())*
            }
            fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]> {
                let ($t, $($rt,)*) = self;
                let dst = $t.encode(dst)?;
                $(let dst = $rt.encode(dst)?;)*
                Some(dst)
            }
            fn decode(pkt: &'a [u8]) -> Result<(Self, &'a [u8]), Disconnection> {
                let ($t, pkt) = $t::decode(pkt)?;
                $(let ($rt, pkt) = $rt::decode(pkt)?;)*
                Ok((($t, $($rt,)*), pkt))
            }
        }
        impl_wire!($($rt)*);
    }
}
impl_wire!(A B C D E F);

macro_rules! le {
    { $($i:ident)* } => {
        $(
            pub fn $i(buf: &[u8]) -> Option<($i, &[u8])> {
                (buf.len() >= core::mem::size_of::<$i>()).then(|| {
                    let (n, rem) = buf.split_at(core::mem::size_of::<$i>());
                    let mut raw = [0; core::mem::size_of::<$i>()];
                    raw.copy_from_slice(n);
                    ($i::from_le_bytes(raw), rem)
                })
            }
            impl Wire<'_> for $i {
                fn encoded_len(&self) -> usize {
                    core::mem::size_of::<$i>()
                }
                fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]> {
                    put(dst, &self.to_le_bytes())
                }
                fn decode(pkt: &[u8]) -> Result<(Self, &[u8]), Disconnection> {
                    $i(pkt).ok_or(Disconnection::new(concat!("truncated ", stringify!($i))))
                }
            }
        )*
    }
}
le! { u8 u16 u32 }

/// Copies `bytes` to the front of `dst`, returning the rest.
pub fn put<'b>(dst: &'b mut [u8], bytes: &[u8]) -> Option<&'b mut [u8]> {
    if dst.len() < bytes.len() {
        return None;
    }
    let (head, rest) = dst.split_at_mut(bytes.len());
    head.copy_from_slice(bytes);
    Some(rest)
}
pub fn bytes(buf: &[u8], n: usize) -> Option<(&[u8], &[u8])> {
    (buf.len() >= n).then(|| buf.split_at(n))
}

impl Wire<'_> for bool {
    fn encoded_len(&self) -> usize {
        1
    }
    fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]> {
        (*self as u8).encode(dst)
    }
    fn decode(pkt: &[u8]) -> Result<(Self, &[u8]), Disconnection> {
        let (b, rem) = u8::decode(pkt)?;
        Ok((match b {
            0 => false,
            1 => true,
            _ => return Err(Disconnection::new("boolean out of range")),
        }, rem))
    }
}
impl<const N: usize> Wire<'_> for [u8; N] {
    fn encoded_len(&self) -> usize {
        N
    }
    fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]> {
        put(dst, self)
    }
    fn decode(pkt: &[u8]) -> Result<(Self, &[u8]), Disconnection> {
        let (raw, rem) = bytes(pkt, N).ok_or(Disconnection::new("truncated byte array"))?;
        let mut out = [0; N];
        out.copy_from_slice(raw);
        Ok((out, rem))
    }
}
impl Wire<'_> for Coordinates {
    fn encoded_len(&self) -> usize {
        4
    }
    fn encode<'b>(&self, dst: &'b mut [u8]) -> Option<&'b mut [u8]> {
        (self.x, self.y).encode(dst)
    }
    fn decode(pkt: &[u8]) -> Result<(Self, &[u8]), Disconnection> {
        let ((x, y), rem) = Wire::decode(pkt)?;
        Ok((Self { x, y }, rem))
    }
}
