use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder};
use digest::typenum::Unsigned;
use digest::KeyInit;
use generic_array::{ArrayLength, GenericArray};
use subtle::ConstantTimeEq;

use super::{Mac, MacAlgorithm};

/// An HMAC over `sequence_number || unencrypted packet`, keyed with `KL`
/// bytes of derived key material.
pub struct CryptoMacAlgorithm<
    M: digest::Mac + KeyInit + Clone + Send + 'static,
    KL: ArrayLength<u8> + 'static,
>(pub PhantomData<M>, pub PhantomData<KL>);

pub struct CryptoMac<M: digest::Mac + KeyInit + Clone + Send + 'static> {
    // Keyed once; every packet works on a copy.
    pub(crate) keyed: M,
}

impl<M: digest::Mac + KeyInit + Clone + Send + 'static, KL: ArrayLength<u8> + 'static>
    MacAlgorithm for CryptoMacAlgorithm<M, KL>
{
    fn key_len(&self) -> usize {
        KL::to_usize()
    }

    fn make_mac(&self, mac_key: &[u8]) -> Result<Box<dyn Mac + Send>, crate::Error> {
        let key = mac_key.get(..KL::to_usize()).ok_or(crate::Error::KexInit)?;
        let keyed = <M as digest::Mac>::new_from_slice(key).map_err(|_| crate::Error::KexInit)?;
        Ok(Box::new(CryptoMac::<M> { keyed }) as Box<dyn Mac + Send>)
    }
}

impl<M: digest::Mac + KeyInit + Clone + Send + 'static> Mac for CryptoMac<M> {
    fn mac_len(&self) -> usize {
        M::OutputSize::to_usize()
    }

    fn compute(&self, sequence_number: u32, payload: &[u8], output: &mut [u8]) {
        let mut hmac = self.keyed.clone();
        let mut seqno_buf = [0; 4];
        BigEndian::write_u32(&mut seqno_buf, sequence_number);
        digest::Mac::update(&mut hmac, &seqno_buf);
        digest::Mac::update(&mut hmac, payload);
        output.clone_from_slice(&digest::Mac::finalize(hmac).into_bytes());
    }

    fn verify(&self, sequence_number: u32, payload: &[u8], mac: &[u8]) -> bool {
        let mut buf = GenericArray::<u8, M::OutputSize>::default();
        self.compute(sequence_number, payload, &mut buf);
        buf.ct_eq(mac).into()
    }
}
