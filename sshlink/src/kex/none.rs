// Copyright 2016 Pierre-Étienne Meunier
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

use super::{KexAlgorithm, KexType};
use crate::cipher::{self, CipherPair};
use crate::mac;
use crate::session::Exchange;
use crate::Error;

pub struct NoneKexType {}

impl KexType for NoneKexType {
    fn make(&self) -> Box<dyn KexAlgorithm + Send> {
        Box::new(NoneKexAlgorithm {})
    }
}

#[doc(hidden)]
pub struct NoneKexAlgorithm {}

impl KexAlgorithm for NoneKexAlgorithm {
    fn skip_exchange(&self) -> bool {
        true
    }

    fn server_dh(&mut self, _exchange: &mut Exchange, _payload: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn client_dh(
        &mut self,
        _client_ephemeral: &mut Vec<u8>,
        _buf: &mut Vec<u8>,
    ) -> Result<(), Error> {
        Ok(())
    }

    fn compute_shared_secret(&mut self, _remote_pubkey: &[u8]) -> Result<(), Error> {
        Ok(())
    }

    fn compute_exchange_hash(&self, _key: &[u8], _exchange: &Exchange) -> Result<Vec<u8>, Error> {
        Ok(Vec::new())
    }

    fn compute_keys(
        &self,
        session_id: &[u8],
        exchange_hash: &[u8],
        cipher: cipher::Name,
        remote_to_local_mac: mac::Name,
        local_to_remote_mac: mac::Name,
        is_server: bool,
    ) -> Result<CipherPair, Error> {
        super::compute_keys::<sha2::Sha256>(
            None,
            session_id,
            exchange_hash,
            cipher,
            remote_to_local_mac,
            local_to_remote_mac,
            is_server,
        )
    }
}
