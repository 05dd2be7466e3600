// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Authenticode PKCS#7 construction.

An Authenticode signature is a PKCS#7 `SignedData` whose content is a
`SpcIndirectDataContent` holding the digest of the signed file. The signer
signs the DER encoding of its authenticated attributes, which include a
digest of that content.
*/

use {
    super::{der, timestamp::Countersignature, DigestAlgorithm},
    crate::error::{Result, SigningError},
    yasna::{models::ObjectIdentifier, DERWriter, Tag},
};

const OID_SIGNED_DATA: &[u64] = &[1, 2, 840, 113549, 1, 7, 2];
const OID_CONTENT_TYPE: &[u64] = &[1, 2, 840, 113549, 1, 9, 3];
const OID_MESSAGE_DIGEST: &[u64] = &[1, 2, 840, 113549, 1, 9, 4];
const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113549, 1, 1, 1];
const OID_SPC_INDIRECT_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 4];
const OID_SPC_STATEMENT_TYPE: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 11];
const OID_SPC_SP_OPUS_INFO: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 12];
const OID_SPC_PE_IMAGE_DATA: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 15];
const OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 21];
const OID_SPC_SIPINFO: &[u64] = &[1, 3, 6, 1, 4, 1, 311, 2, 1, 30];

/// Subject interface package GUID for Windows Installer packages.
const MSI_SIP_GUID: [u8; 16] = [
    0xf1, 0x10, 0x0c, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x46,
];

fn write_oid(writer: DERWriter, oid: &[u64]) {
    writer.write_oid(&ObjectIdentifier::from_slice(oid));
}

fn write_algorithm(writer: DERWriter, oid: &[u64]) {
    writer.write_sequence(|writer| {
        write_oid(writer.next(), oid);
        writer.next().write_null();
    });
}

/// `SpcString ::= CHOICE { unicode [0] IMPLICIT BMPString, .. }`
fn write_spc_string(writer: DERWriter, value: &str) {
    let encoded = value
        .encode_utf16()
        .flat_map(|c| c.to_be_bytes())
        .collect::<Vec<_>>();

    writer.write_tagged_implicit(Tag::context(0), |writer| writer.write_bytes(&encoded));
}

fn write_digest_info(writer: DERWriter, digest: &[u8], algorithm: DigestAlgorithm) {
    writer.write_sequence(|writer| {
        write_algorithm(writer.next(), algorithm.oid());
        writer.next().write_bytes(digest);
    });
}

/// `SpcIndirectDataContent` for a PE image digest.
pub fn spc_indirect_data_pe(digest: &[u8], algorithm: DigestAlgorithm) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                write_oid(writer.next(), OID_SPC_PE_IMAGE_DATA);
                // SpcPeImageData { flags, file [0] SpcLink }
                writer.next().write_sequence(|writer| {
                    // Empty BIT STRING.
                    writer.next().write_der(&[0x03, 0x01, 0x00]);
                    writer.next().write_tagged(Tag::context(0), |writer| {
                        writer.write_tagged(Tag::context(2), |writer| {
                            write_spc_string(writer, "<<<Obsolete>>>");
                        });
                    });
                });
            });
            write_digest_info(writer.next(), digest, algorithm);
        });
    })
}

/// `SpcIndirectDataContent` for a Windows Installer digest.
pub fn spc_indirect_data_msi(digest: &[u8], algorithm: DigestAlgorithm) -> Vec<u8> {
    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            writer.next().write_sequence(|writer| {
                write_oid(writer.next(), OID_SPC_SIPINFO);
                writer.next().write_sequence(|writer| {
                    writer.next().write_u32(1);
                    writer.next().write_bytes(&MSI_SIP_GUID);
                    for _ in 0..5 {
                        writer.next().write_u32(0);
                    }
                });
            });
            write_digest_info(writer.next(), digest, algorithm);
        });
    })
}

fn write_attribute(writer: DERWriter, oid: &[u64], value: impl FnOnce(DERWriter)) {
    writer.write_sequence(|writer| {
        write_oid(writer.next(), oid);
        writer.next().write_set(|writer| value(writer.next()));
    });
}

/// Authenticated attributes of a signer.
#[derive(Clone, Debug)]
pub struct AuthenticatedAttributes {
    set_der: Vec<u8>,
}

impl AuthenticatedAttributes {
    /// Build attributes for the given `SpcIndirectDataContent`.
    ///
    /// `comment` becomes the program name shown in signature dialogs.
    pub fn new(
        spc_indirect_data: &[u8],
        algorithm: DigestAlgorithm,
        comment: Option<&str>,
    ) -> Result<Self> {
        // The message digest covers the content octets, not the SEQUENCE
        // header.
        let (content, _) = der::read_element(spc_indirect_data)?;
        let message_digest = algorithm.digest(content.content);

        let attributes = [
            yasna::construct_der(|writer| {
                write_attribute(writer, OID_CONTENT_TYPE, |writer| {
                    write_oid(writer, OID_SPC_INDIRECT_DATA)
                })
            }),
            yasna::construct_der(|writer| {
                write_attribute(writer, OID_SPC_SP_OPUS_INFO, |writer| {
                    writer.write_sequence(|writer| {
                        if let Some(comment) = comment {
                            writer.next().write_tagged(Tag::context(0), |writer| {
                                write_spc_string(writer, comment);
                            });
                        }
                    })
                })
            }),
            yasna::construct_der(|writer| {
                write_attribute(writer, OID_SPC_STATEMENT_TYPE, |writer| {
                    writer.write_sequence(|writer| {
                        write_oid(writer.next(), OID_SPC_INDIVIDUAL_SP_KEY_PURPOSE);
                    })
                })
            }),
            yasna::construct_der(|writer| {
                write_attribute(writer, OID_MESSAGE_DIGEST, |writer| {
                    writer.write_bytes(&message_digest)
                })
            }),
        ];

        let set_der = yasna::construct_der(|writer| {
            writer.write_set_of(|writer| {
                for attribute in &attributes {
                    writer.next().write_der(attribute);
                }
            })
        });

        Ok(Self { set_der })
    }

    /// The bytes the signer signs: the attributes as a DER `SET OF`.
    pub fn signed_bytes(&self) -> &[u8] {
        &self.set_der
    }

    /// The attributes as embedded in `SignerInfo` (`[0] IMPLICIT`).
    fn implicit_der(&self) -> Vec<u8> {
        let mut der = self.set_der.clone();
        der[0] = 0xa0;
        der
    }
}

/// Certificates identifying the signer.
#[derive(Clone, Debug)]
pub struct SignerIdentity {
    issuer: Vec<u8>,
    serial: Vec<u8>,
    certificates: Vec<Vec<u8>>,
}

impl SignerIdentity {
    /// Construct from DER certificates. The first is the signing
    /// certificate.
    pub fn new(certificates: Vec<Vec<u8>>) -> Result<Self> {
        let signer = certificates
            .first()
            .ok_or_else(|| SigningError::Config("no signing certificate".into()))?;
        let (issuer, serial) = der::issuer_and_serial(signer)?;

        Ok(Self {
            issuer,
            serial,
            certificates,
        })
    }

    /// Load PEM certificates. The first certificate of the first source is
    /// the signing certificate.
    pub fn from_pem_sources(sources: &[&[u8]]) -> Result<Self> {
        let mut certificates = vec![];
        for source in sources {
            let pems = pem::parse_many(source)
                .map_err(|e| SigningError::Config(format!("invalid PEM: {}", e)))?;
            certificates.extend(
                pems.into_iter()
                    .filter(|p| p.tag() == "CERTIFICATE")
                    .map(|p| p.contents().to_vec()),
            );
        }

        Self::new(certificates)
    }

    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.certificates
    }
}

/// Assemble the PKCS#7 `ContentInfo` holding an Authenticode signature.
///
/// A countersignature becomes the only unsigned attribute of the signer.
pub fn signed_data(
    spc_indirect_data: &[u8],
    attributes: &AuthenticatedAttributes,
    algorithm: DigestAlgorithm,
    signer: &SignerIdentity,
    signature: &[u8],
    countersignature: Option<&Countersignature>,
) -> Vec<u8> {
    let extra_certificates = countersignature
        .map(|c| c.certificates.as_slice())
        .unwrap_or_default();

    yasna::construct_der(|writer| {
        writer.write_sequence(|writer| {
            write_oid(writer.next(), OID_SIGNED_DATA);
            writer.next().write_tagged(Tag::context(0), |writer| {
                writer.write_sequence(|writer| {
                    writer.next().write_u8(1);
                    writer.next().write_set(|writer| {
                        write_algorithm(writer.next(), algorithm.oid());
                    });
                    writer.next().write_sequence(|writer| {
                        write_oid(writer.next(), OID_SPC_INDIRECT_DATA);
                        writer.next().write_tagged(Tag::context(0), |writer| {
                            writer.write_der(spc_indirect_data);
                        });
                    });
                    writer
                        .next()
                        .write_tagged_implicit(Tag::context(0), |writer| {
                            writer.write_set_of(|writer| {
                                for cert in signer.certificates.iter().chain(extra_certificates) {
                                    writer.next().write_der(cert);
                                }
                            });
                        });
                    writer.next().write_set(|writer| {
                        writer.next().write_sequence(|writer| {
                            writer.next().write_u8(1);
                            writer.next().write_sequence(|writer| {
                                writer.next().write_der(&signer.issuer);
                                writer.next().write_der(&signer.serial);
                            });
                            write_algorithm(writer.next(), algorithm.oid());
                            writer.next().write_der(&attributes.implicit_der());
                            write_algorithm(writer.next(), OID_RSA_ENCRYPTION);
                            writer.next().write_bytes(signature);
                            if let Some(countersignature) = countersignature {
                                writer.next().write_tagged_implicit(
                                    Tag::context(1),
                                    |writer| {
                                        writer.write_set_of(|writer| {
                                            writer.next().write_der(&countersignature.attribute);
                                        });
                                    },
                                );
                            }
                        });
                    });
                });
            });
        });
    })
}

#[cfg(test)]
mod tests {
    use {super::*, crate::testutil::fake_certificate};

    #[test]
    fn pe_indirect_data_layout() -> Result<()> {
        let digest = [0x11u8; 32];
        let spc = spc_indirect_data_pe(&digest, DigestAlgorithm::Sha256);

        let (outer, rest) = der::read_element(&spc)?;
        assert!(rest.is_empty());
        assert_eq!(outer.tag, 0x30);
        assert!(spc.ends_with(&digest));

        // "<<<Obsolete>>>" as UTF-16BE.
        let obsolete = "<<<Obsolete>>>"
            .encode_utf16()
            .flat_map(|c| c.to_be_bytes())
            .collect::<Vec<_>>();
        assert!(spc.windows(obsolete.len()).any(|w| w == obsolete));

        let msi = spc_indirect_data_msi(&digest, DigestAlgorithm::Sha256);
        assert!(msi.windows(16).any(|w| w == MSI_SIP_GUID));

        Ok(())
    }

    #[test]
    fn attributes_are_a_der_set() -> Result<()> {
        let spc = spc_indirect_data_pe(&[0u8; 32], DigestAlgorithm::Sha256);
        let attrs = AuthenticatedAttributes::new(&spc, DigestAlgorithm::Sha256, Some("Firefox"))?;

        let (set, rest) = der::read_element(attrs.signed_bytes())?;
        assert!(rest.is_empty());
        assert_eq!(set.tag, 0x31);
        assert_eq!(attrs.implicit_der()[0], 0xa0);
        assert_eq!(&attrs.implicit_der()[1..], &attrs.signed_bytes()[1..]);

        let (content, _) = der::read_element(&spc)?;
        let digest = DigestAlgorithm::Sha256.digest(content.content);
        assert!(attrs
            .signed_bytes()
            .windows(digest.len())
            .any(|w| w == digest.as_slice()));

        let without = AuthenticatedAttributes::new(&spc, DigestAlgorithm::Sha256, None)?;
        assert!(without.signed_bytes().len() < attrs.signed_bytes().len());

        Ok(())
    }

    #[test]
    fn signed_data_contains_parts() -> Result<()> {
        let signer = SignerIdentity::new(vec![
            fake_certificate("Signer", 7),
            fake_certificate("Intermediate", 8),
        ])?;
        let spc = spc_indirect_data_pe(&[0u8; 32], DigestAlgorithm::Sha256);
        let attrs = AuthenticatedAttributes::new(&spc, DigestAlgorithm::Sha256, None)?;
        let signature = vec![0xeeu8; 256];

        let pkcs7 = signed_data(
            &spc,
            &attrs,
            DigestAlgorithm::Sha256,
            &signer,
            &signature,
            None,
        );
        let (outer, rest) = der::read_element(&pkcs7)?;
        assert!(rest.is_empty());
        assert_eq!(outer.tag, 0x30);
        assert!(pkcs7.windows(spc.len()).any(|w| w == spc.as_slice()));
        assert!(pkcs7.ends_with(&signature));
        for cert in signer.certificates() {
            assert!(pkcs7.windows(cert.len()).any(|w| w == cert.as_slice()));
        }

        assert!(SignerIdentity::new(vec![]).is_err());

        Ok(())
    }

    #[test]
    fn countersignature_is_unsigned_attribute() -> Result<()> {
        let signer = SignerIdentity::new(vec![fake_certificate("Signer", 7)])?;
        let spc = spc_indirect_data_pe(&[0u8; 32], DigestAlgorithm::Sha256);
        let attrs = AuthenticatedAttributes::new(&spc, DigestAlgorithm::Sha256, None)?;
        let signature = vec![0xeeu8; 256];
        let tsa = fake_certificate("Timestamp Authority", 9);
        let countersignature = Countersignature {
            attribute: yasna::construct_der(|writer| {
                write_attribute(writer, &[1, 2, 840, 113549, 1, 9, 6], |writer| {
                    writer.write_bytes(b"countersigned")
                })
            }),
            certificates: vec![tsa.clone()],
        };

        let pkcs7 = signed_data(
            &spc,
            &attrs,
            DigestAlgorithm::Sha256,
            &signer,
            &signature,
            Some(&countersignature),
        );

        // [1] IMPLICIT SET OF Attribute trails the signature value.
        let mut unsigned = vec![0xa1, countersignature.attribute.len() as u8];
        unsigned.extend_from_slice(&countersignature.attribute);
        assert!(pkcs7.ends_with(&unsigned));
        let before = &pkcs7[..pkcs7.len() - unsigned.len()];
        assert!(before.ends_with(&signature));
        assert!(pkcs7.windows(tsa.len()).any(|w| w == tsa.as_slice()));

        Ok(())
    }

    #[test]
    fn pem_loading() -> Result<()> {
        let chain = format!(
            "{}{}",
            pem::encode(&pem::Pem::new("CERTIFICATE", fake_certificate("Signer", 1))),
            pem::encode(&pem::Pem::new("CERTIFICATE", fake_certificate("CA", 2))),
        );
        let cross = pem::encode(&pem::Pem::new("CERTIFICATE", fake_certificate("Cross", 3)));

        let signer = SignerIdentity::from_pem_sources(&[chain.as_bytes(), cross.as_bytes()])?;
        assert_eq!(signer.certificates().len(), 3);
        assert_eq!(signer.serial, yasna::construct_der(|w| w.write_u32(1)));

        Ok(())
    }
}
